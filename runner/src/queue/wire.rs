use super::{QueueError, QueueName};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use serde_json::Value;
use std::io::{BufRead, Write};

pub const PROTOCOL_VERSION: u32 = 1;

#[derive(Deserialize, Serialize, Debug)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum Request {
    Hello { secret: String, version: u32 },
    Put { queue: QueueName, item: Value },
    GetNowait { queue: QueueName },
    Len { queue: QueueName },
}

#[derive(Deserialize, Serialize, Debug)]
#[serde(tag = "reply", rename_all = "snake_case")]
pub enum Response {
    Welcome,
    Denied { reason: String },
    Ok,
    Item { item: Option<Value> },
    Length { length: usize },
    Full,
    Error { message: String },
}

/// one JSON document per line
pub fn write_frame<W: Write, T: Serialize>(writer: &mut W, frame: &T) -> Result<(), QueueError> {
    serde_json::to_writer(&mut *writer, frame)?;
    writer.write_all(b"\n")?;
    writer.flush()?;

    Ok(())
}

/// `Ok(None)` once the peer closed the stream
pub fn read_frame<R: BufRead, T: DeserializeOwned>(reader: &mut R) -> Result<Option<T>, QueueError> {
    let mut line = String::new();

    if reader.read_line(&mut line)? == 0 {
        return Ok(None);
    }

    Ok(Some(serde_json::from_str(line.trim_end())?))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    #[test]
    fn frames_are_line_delimited() {
        let mut buffer = Vec::new();
        write_frame(
            &mut buffer,
            &Request::Put {
                queue: QueueName::Results,
                item: serde_json::json!({ "text": "multi\nline" }),
            },
        )
        .unwrap();
        write_frame(&mut buffer, &Request::Len { queue: QueueName::Jobs }).unwrap();

        assert_eq!(buffer.iter().filter(|byte| **byte == b'\n').count(), 2);

        let mut reader = Cursor::new(buffer);
        let first: Request = read_frame(&mut reader).unwrap().unwrap();
        assert!(matches!(first, Request::Put { queue: QueueName::Results, .. }));
        let second: Request = read_frame(&mut reader).unwrap().unwrap();
        assert!(matches!(second, Request::Len { queue: QueueName::Jobs }));
        assert!(read_frame::<_, Request>(&mut reader).unwrap().is_none());
    }
}
