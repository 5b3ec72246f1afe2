//! MongoDB replication with the native driver.
//!
//! Every collection of the origin database is dumped into its own BSON file
//! (`<dump dir>/<database>-<timestamp>-<sequence>/<collection>.bson`). Each
//! target collection of the same name is then dropped, recreated with the
//! origin's indexes and filled from its file.
//!
//! A `schema-only` record copies collections and indexes without documents, so
//! nothing is dumped.

use std::fs::{self, File};
use std::io::{BufRead, BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use chrono::Local;
use mongodb::bson::{doc, Document};
use mongodb::options::{ClientOptions, Credential, ServerAddress};
use mongodb::sync::{Client, Collection, Database};
use mongodb::IndexModel;

use crate::backends::{ConnectLock, ConnectOutcome, Driver, DriverError, Handle};
use crate::config::{BackendRecord, BackupType, Config, EngineConfig, Endpoint};
use crate::engine::{DriverRegistry, JobLog, Materializer, ResourceExhausted};
use crate::util::paths;

pub const NAME: &str = "mongodb";

/// Documents per `insert_many` call when restoring.
const RESTORE_BATCH: usize = 1000;

/// Name of the index MongoDB creates for every collection.
const ID_INDEX: &str = "_id_";

static CONNECT_LOCK: ConnectLock = ConnectLock::new();

static DUMP_SEQUENCE: AtomicUsize = AtomicUsize::new(0);

pub fn register(registry: &mut DriverRegistry) {
    registry.register(NAME, construct);
}

fn construct(config: &Config, materializer: &mut Materializer<'_>) -> Result<usize, ResourceExhausted> {
    let settings = MongoSettings::from_config(&config.engine);
    materializer.materialize(NAME, &config.mongodb, |record| {
        Ok(Box::new(MongoDriver::new(record.clone(), settings.clone())) as Box<dyn Driver>)
    })
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MongoSettings {
    pub dump_dir: PathBuf,
    pub connect_timeout: Duration,
    pub keep_dumps: bool,
}

impl MongoSettings {
    pub fn from_config(engine: &EngineConfig) -> Self {
        Self {
            dump_dir: engine.dump_directory(),
            connect_timeout: engine.connect_timeout(),
            keep_dumps: engine.keep_dumps,
        }
    }
}

/// Client options for `endpoint`, authenticating against its database.
pub fn client_options(endpoint: &Endpoint, connect_timeout: Duration) -> ClientOptions {
    let mut credential = Credential::default();
    credential.username = Some(endpoint.user.clone());
    credential.password = Some(endpoint.password.clone());
    credential.source = Some(endpoint.database.clone());

    let mut options = ClientOptions::default();
    options.hosts = vec![ServerAddress::Tcp {
        host: endpoint.host.clone(),
        port: Some(endpoint.port),
    }];
    options.credential = Some(credential);
    options.connect_timeout = Some(connect_timeout);
    options.server_selection_timeout = Some(connect_timeout);
    options.app_name = Some("cnc".to_string());
    options
}

fn client_error(context: &str) -> impl FnOnce(mongodb::error::Error) -> DriverError + '_ {
    move |e| DriverError::Client(format!("{context}: {e}"))
}

fn connect_client(endpoint: &Endpoint, timeout: Duration) -> Result<Client, DriverError> {
    let connect_error = |reason: String| DriverError::Connect {
        endpoint: endpoint.to_string(),
        reason,
    };

    let client = Client::with_options(client_options(endpoint, timeout))
        .map_err(|e| connect_error(e.to_string()))?;
    // The driver connects lazily, ping to find out if the server is usable.
    client
        .database(&endpoint.database)
        .run_command(doc! { "ping": 1 })
        .run()
        .map_err(|e| connect_error(e.to_string()))?;

    Ok(client)
}

/// Writes every document of `collection` to `path`. Returns the number of documents.
fn dump_collection(collection: &Collection<Document>, path: &Path) -> Result<u64, DriverError> {
    let mut out = BufWriter::new(File::create_new(path)?);
    let cursor = collection
        .find(doc! {})
        .run()
        .map_err(client_error(collection.name()))?;

    let mut count = 0;
    for document in cursor {
        let document = document.map_err(client_error(collection.name()))?;
        document
            .to_writer(&mut out)
            .map_err(|e| DriverError::Client(format!("encoding a document of `{}`: {e}", collection.name())))?;
        count += 1;
    }
    out.flush()?;

    Ok(count)
}

/// Indexes of `collection` except the implicit `_id` index.
fn user_indexes(collection: &Collection<Document>) -> Result<Vec<IndexModel>, DriverError> {
    let indexes = collection
        .list_indexes()
        .run()
        .map_err(client_error(collection.name()))?
        .collect::<Result<Vec<_>, _>>()
        .map_err(client_error(collection.name()))?;
    Ok(without_id_index(indexes))
}

fn without_id_index(mut indexes: Vec<IndexModel>) -> Vec<IndexModel> {
    indexes.retain(|index| {
        index
            .options
            .as_ref()
            .and_then(|options| options.name.as_deref())
            != Some(ID_INDEX)
    });
    indexes
}

/// Drops `collection` and creates it again, empty, with `indexes`.
fn recreate_collection(
    database: &Database,
    collection: &Collection<Document>,
    indexes: Vec<IndexModel>,
) -> Result<(), DriverError> {
    let name = collection.name();
    collection.drop().run().map_err(client_error(name))?;
    database.create_collection(name).run().map_err(client_error(name))?;

    if !indexes.is_empty() {
        collection
            .create_indexes(indexes)
            .run()
            .map_err(client_error(name))?;
    }
    Ok(())
}

/// Inserts the documents stored at `path` into `collection`.
fn restore_documents(collection: &Collection<Document>, path: &Path) -> Result<u64, DriverError> {
    let name = collection.name();
    let mut reader = BufReader::new(File::open(path)?);
    let mut batch = Vec::with_capacity(RESTORE_BATCH);
    let mut count = 0;

    while !reader.fill_buf()?.is_empty() {
        let document = Document::from_reader(&mut reader)
            .map_err(|e| DriverError::Client(format!("decoding {}: {e}", path.display())))?;
        batch.push(document);

        if batch.len() == RESTORE_BATCH {
            count += batch.len() as u64;
            collection
                .insert_many(std::mem::take(&mut batch))
                .run()
                .map_err(client_error(name))?;
        }
    }
    if !batch.is_empty() {
        count += batch.len() as u64;
        collection.insert_many(batch).run().map_err(client_error(name))?;
    }

    Ok(count)
}

fn user_collections(database: &Database) -> Result<Vec<String>, DriverError> {
    let mut names = database
        .list_collection_names()
        .run()
        .map_err(client_error(database.name()))?;
    names.retain(|name| !name.starts_with("system."));
    names.sort();
    Ok(names)
}

pub struct MongoDriver {
    record: BackendRecord,
    settings: MongoSettings,
    origin: Handle<Client>,
    target: Handle<Client>,
    /// Dump of a replication that hasn't finished.
    dump_dir: Option<PathBuf>,
}

impl MongoDriver {
    pub fn new(record: BackendRecord, settings: MongoSettings) -> Self {
        Self {
            record,
            settings,
            origin: Handle::Unset,
            target: Handle::Unset,
            dump_dir: None,
        }
    }

    /// A fresh directory for the documents of this record, `None` if it
    /// copies the schema only.
    fn dump_directory(&self) -> Option<PathBuf> {
        if self.record.backup_type == BackupType::SchemaOnly {
            return None;
        }

        let timestamp = Local::now().format("%Y-%m-%dT%H-%M-%S");
        let sequence = DUMP_SEQUENCE.fetch_add(1, Ordering::Relaxed);
        let database = paths::sanitize_file_component(&self.record.origin.database);
        Some(
            self.settings
                .dump_dir
                .join(format!("{database}-{timestamp}-{sequence}")),
        )
    }
}

fn dump_file(dump_dir: &Path, collection: &str) -> PathBuf {
    dump_dir.join(format!("{}.bson", paths::sanitize_file_component(collection)))
}

impl Driver for MongoDriver {
    fn connect(&mut self, log: &mut JobLog) -> Result<ConnectOutcome, DriverError> {
        if !self.record.enabled {
            return Ok(ConnectOutcome::Disabled);
        }

        let timeout = self.settings.connect_timeout;
        log.info(format_args!("Connecting to origin {}", self.record.origin));
        let origin = CONNECT_LOCK.connect(|| connect_client(&self.record.origin, timeout))?;
        self.origin = Handle::Open(origin);

        log.info(format_args!("Connecting to target {}", self.record.target));
        let target = CONNECT_LOCK.connect(|| connect_client(&self.record.target, timeout))?;
        self.target = Handle::Open(target);

        Ok(ConnectOutcome::Connected)
    }

    fn replicate(&mut self, log: &mut JobLog) -> Result<(), DriverError> {
        let origin = self
            .origin
            .get_mut()
            .ok_or(DriverError::NotConnected("origin"))?
            .database(&self.record.origin.database);
        let target = self
            .target
            .get_mut()
            .ok_or(DriverError::NotConnected("target"))?
            .database(&self.record.target.database);

        let collections = user_collections(&origin)?;
        let dump_dir = self.dump_directory();

        match &dump_dir {
            Some(dir) => {
                log.info(format_args!(
                    "Dumping {} collection(s) of `{}` to {}",
                    collections.len(),
                    origin.name(),
                    dir.display()
                ));
                fs::create_dir_all(dir)?;
                self.dump_dir = Some(dir.clone());

                for name in &collections {
                    let count = dump_collection(&origin.collection(name), &dump_file(dir, name))?;
                    log.info(format_args!("Dumped {count} document(s) of `{name}`"));
                }
            }
            None => log.info(format_args!(
                "Copying the schema of {} collection(s) of `{}`",
                collections.len(),
                origin.name()
            )),
        }

        for name in &collections {
            let indexes = user_indexes(&origin.collection(name))?;
            let index_count = indexes.len();
            let collection = target.collection(name);
            recreate_collection(&target, &collection, indexes)?;
            log.info(format_args!(
                "Created `{}.{name}` with {index_count} index(es)",
                target.name()
            ));

            if let Some(dir) = &dump_dir {
                let count = restore_documents(&collection, &dump_file(dir, name))?;
                log.info(format_args!("Restored {count} document(s) into `{}.{name}`", target.name()));
            }
        }

        if let Some(dir) = dump_dir {
            if self.settings.keep_dumps {
                log.info(format_args!("Keeping dump {}", dir.display()));
            } else {
                fs::remove_dir_all(&dir)?;
            }
        }
        self.dump_dir = None;

        Ok(())
    }

    fn close(&mut self, log: &mut JobLog) -> Result<(), DriverError> {
        if let Some(dump_dir) = self.dump_dir.take() {
            if dump_dir.exists() {
                log.warn(format_args!("Dump of the failed run is kept at {}", dump_dir.display()));
            }
        }

        for (side, handle) in [("origin", &mut self.origin), ("target", &mut self.target)] {
            if let Some(client) = handle.close() {
                log::trace!(target: "backend::mongodb", "Shutting down {side} client of `{}`", self.record.origin.database);
                client.shutdown().run();
            }
        }
        Ok(())
    }
}
