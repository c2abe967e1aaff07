use super::{CampaignId, StoreError, SQL_SCHEMA, SQL_SCHEMA_NUMBER};
use crate::{
    buffer::{ResultBuffer, Slot},
    config::DatabaseConfig,
    job::{Job, JobId},
};
use rusqlite::{params, Connection};
use std::path::Path;
use tracing::{debug, error, info};

/// Persists finished sweeps: one campaign row, its jobs and their results
#[derive(Debug)]
pub struct ResultStore {
    connection: Connection,
}

/// a stored result row, `(job, status, reason)`
pub type StoredResult = (JobId, String, Option<String>);

impl ResultStore {
    pub fn open(path: &Path) -> Result<Self, StoreError> {
        let connection = Connection::open(path)?;
        debug!(path = %path.to_string_lossy(), "Opened SQLite database");

        Ok(Self { connection })
    }

    pub fn load(config: &DatabaseConfig) -> Result<Self, StoreError> {
        Self::open(&config.path)
    }

    pub fn init(&mut self) -> Result<(), StoreError> {
        let mut counter = 1;

        for table in SQL_SCHEMA {
            match self.connection.execute(table, []) {
                Ok(_) => debug!("Applied SQL schema ({counter}/{SQL_SCHEMA_NUMBER})"),
                Err(error) => {
                    error!(error = ?error, table = table, "Failed to apply SQL schema ({counter}/{SQL_SCHEMA_NUMBER}): {error}");

                    return Err(StoreError::SQLite(error));
                }
            }

            counter += 1;
        }

        Ok(())
    }

    pub fn new_campaign(&self, name: &str, comment: Option<&str>) -> Result<CampaignId, StoreError> {
        self.connection
            .prepare_cached("insert into campaigns (name, comment) values (?, ?)")?
            .execute(params![name, comment])?;
        let id = self.connection.last_insert_rowid();

        info!(id = id, name = name, "Created new campaign");

        Ok(id)
    }

    /// Store all jobs and every result that arrived, in a single transaction
    pub fn store_outcome(
        &self,
        campaign: CampaignId,
        jobs: &[Job],
        buffer: &ResultBuffer,
    ) -> Result<usize, StoreError> {
        let mut stored = 0;

        // only one connection exists, so there is never a nested transaction
        let mut tx = self.connection.unchecked_transaction()?;
        tx.set_drop_behavior(rusqlite::DropBehavior::Rollback);

        for job in jobs {
            tx.prepare_cached("insert or replace into jobs (campaign, id, parameters) values (?, ?, ?)")?
                .execute(params![
                    campaign,
                    job.id as i64,
                    serde_yaml::to_string(&job.parameters)?
                ])?;
        }

        for (id, slot) in buffer.iter() {
            let (status, reason, metrics) = match slot {
                Slot::Missing => continue,
                Slot::Done(metrics) => ("success", None, serde_yaml::to_string(metrics)?),
                Slot::Failed(reason) => ("failure", Some(reason.as_str()), "{}".to_owned()),
            };

            tx.prepare_cached(
                "insert or replace into results
                 (campaign, job, status, reason, metrics) values (?, ?, ?, ?, ?)",
            )?
            .execute(params![campaign, id as i64, status, reason, metrics])?;
            stored += 1;
        }

        tx.commit()?;

        info!(campaign = campaign, "Stored {} jobs and {stored} results", jobs.len());

        Ok(stored)
    }

    pub fn results(&self, campaign: CampaignId) -> Result<Vec<StoredResult>, StoreError> {
        let rows = self
            .connection
            .prepare_cached("select job, status, reason from results where campaign = ? order by job")?
            .query_map(params![campaign], |row| {
                Ok((row.get::<_, i64>(0)? as JobId, row.get(1)?, row.get(2)?))
            })?
            .collect::<Result<Vec<_>, _>>()?;

        Ok(rows)
    }

    pub fn close(mut self) -> Result<(), StoreError> {
        let mut counter = 0;
        while let Err((connection, error)) = self.connection.close() {
            counter += 1;
            self.connection = connection;
            error!(error = ?error, "Failed to close SQLite connection: {error}, trying again {counter}/3");

            if counter == 3 {
                return Err(StoreError::SQLite(error));
            }
        }

        debug!("Closed SQLite connection");

        Ok(())
    }
}
