#[cfg(feature = "rusqlite")]
pub mod sqlite;

use thiserror::Error;

#[cfg(feature = "rusqlite")]
pub use sqlite::ResultStore;

/// identifies one stored sweep
pub type CampaignId = i64;

#[derive(Error, Debug)]
pub enum StoreError {
    #[cfg(feature = "rusqlite")]
    #[error("SQLite error: {0}")]
    SQLite(#[from] rusqlite::Error),
    #[error("failed to encode record: {0}")]
    Encode(#[from] serde_yaml::Error),
    #[error("result store support was not compiled in")]
    Unsupported,
}

// ref: https://www.sqlite.org/lang_createtable.html
pub const SQL_SCHEMA: [&str; 3] = [
    "create table if not exists campaigns (
    id integer primary key,
    name text not null,
    comment text,
    created text not null default (datetime('now'))
);",
    "create table if not exists jobs (
    campaign integer not null references campaigns (id),
    id integer not null,
    parameters text not null,
    primary key (campaign, id)
);",
    "create table if not exists results (
    campaign integer not null references campaigns (id),
    job integer not null,
    status text not null,
    reason text,
    metrics text not null,
    primary key (campaign, job),
    foreign key (campaign, job) references jobs (campaign, id)
);",
];
pub const SQL_SCHEMA_NUMBER: usize = SQL_SCHEMA.len();
