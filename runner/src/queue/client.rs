use super::{
    wire::{read_frame, write_frame, Request, Response, PROTOCOL_VERSION},
    QueueError, QueueName, QueueTransport,
};
use serde_json::Value;
use std::{
    io::{BufReader, ErrorKind},
    net::{TcpStream, ToSocketAddrs},
    time::Duration,
};
use tracing::{debug, error};

/// Connection to a remote [`Broker`](super::broker::Broker)
///
/// Every call is a single request/response round trip bounded by the read
/// timeout given at connect time.
#[derive(Debug)]
pub struct RemoteQueues {
    address: String,
    reader: BufReader<TcpStream>,
    writer: TcpStream,
}

impl RemoteQueues {
    pub fn connect(address: &str, secret: &str, timeout: Duration) -> Result<Self, QueueError> {
        let mut last_error = None;
        let mut connected = None;

        for candidate in address.to_socket_addrs()? {
            match TcpStream::connect_timeout(&candidate, timeout) {
                Ok(stream) => {
                    connected = Some(stream);
                    break;
                }
                Err(error) => {
                    debug!(address = %candidate, error = ?error, "Failed to reach broker");
                    last_error = Some(error);
                }
            }
        }

        let stream = match connected {
            Some(stream) => stream,
            None => {
                return Err(QueueError::Io(last_error.unwrap_or_else(|| {
                    std::io::Error::new(ErrorKind::NotFound, "broker address did not resolve")
                })))
            }
        };

        stream.set_nodelay(true)?;
        stream.set_read_timeout(Some(timeout))?;
        stream.set_write_timeout(Some(timeout))?;

        let mut client = Self {
            address: address.to_owned(),
            reader: BufReader::new(stream.try_clone()?),
            writer: stream,
        };

        match client.request(&Request::Hello {
            secret: secret.to_owned(),
            version: PROTOCOL_VERSION,
        })? {
            Response::Welcome => {
                debug!(address = %client.address, "Connected to queue broker");

                Ok(client)
            }
            Response::Denied { reason } => {
                error!(address = %client.address, "Broker refused connection: {reason}");

                Err(QueueError::AuthenticationFailed)
            }
            other => Err(QueueError::Rejected(format!(
                "unexpected handshake reply {other:?}"
            ))),
        }
    }

    pub fn address(&self) -> &str {
        &self.address
    }

    fn request(&mut self, request: &Request) -> Result<Response, QueueError> {
        write_frame(&mut self.writer, request)?;

        read_frame(&mut self.reader)?.ok_or(QueueError::Disconnected)
    }
}

fn unexpected(response: Response) -> QueueError {
    match response {
        Response::Error { message } => QueueError::Rejected(message),
        other => QueueError::Rejected(format!("unexpected reply {other:?}")),
    }
}

impl QueueTransport for RemoteQueues {
    fn put_raw(&mut self, queue: QueueName, item: Value) -> Result<(), QueueError> {
        match self.request(&Request::Put { queue, item })? {
            Response::Ok => Ok(()),
            Response::Full => Err(QueueError::Full(queue)),
            other => Err(unexpected(other)),
        }
    }

    fn get_raw(&mut self, queue: QueueName) -> Result<Option<Value>, QueueError> {
        match self.request(&Request::GetNowait { queue })? {
            Response::Item { item } => Ok(item),
            other => Err(unexpected(other)),
        }
    }

    fn len(&mut self, queue: QueueName) -> Result<usize, QueueError> {
        match self.request(&Request::Len { queue })? {
            Response::Length { length } => Ok(length),
            other => Err(unexpected(other)),
        }
    }
}
