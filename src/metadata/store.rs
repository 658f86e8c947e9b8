//! Snapshot persistence
//!
//! [`store_snapshot`] writes a point-in-time copy of both trees into
//! `.snapshot/` and swaps it in as `snapshot/`. [`StoreWorker`] is the single
//! background consumer of a partition's store queue and owns the leader-only
//! store tick timer.

use std::fs::{self, File};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use byteorder::{BigEndian, WriteBytesExt};
use futures::future::OptionFuture;
use serde::Serialize;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

use super::dentry::{Dentry, DentryKey};
use super::fsm::{ApplyResult, FsmProgress};
use super::inode::Inode;
use super::item::MetaItem;
use super::layout::{
    PartitionConfig, APPLY_FILE, DENTRY_FILE, INODE_FILE, SIGN_FILE, SNAPSHOT_BACKUP_DIR,
    SNAPSHOT_DIR, SNAPSHOT_TMP_DIR,
};
use crate::config::PartitionSettings;
use crate::error::{Error, Result};
use crate::replication::ReplicationEngine;
use crate::tree::IndexedTree;

/// Trees captured by a store tick, together with the log position they reflect
#[derive(Debug, Clone)]
pub struct StoreJob {
    pub apply_index: u64,
    pub cursor: u64,
    pub inodes: IndexedTree<u64, Inode>,
    pub dentries: IndexedTree<DentryKey, Dentry>,
}

/// Messages consumed by the persistence worker
pub enum StoreMsg {
    Store(StoreJob),
    PersistConfig(PartitionConfig),
    StartTick,
    StopTick,
    Destroy,
}

impl StoreMsg {
    pub fn name(&self) -> &'static str {
        match self {
            StoreMsg::Store(_) => "Store",
            StoreMsg::PersistConfig(_) => "PersistConfig",
            StoreMsg::StartTick => "StartTick",
            StoreMsg::StopTick => "StopTick",
            StoreMsg::Destroy => "Destroy",
        }
    }
}

/// Sending side of a partition's store queue
///
/// Store jobs go through a bounded queue and are dropped when it is full, the
/// next store tick captures a newer state anyway. Control messages go through
/// an unbounded channel and are never dropped.
#[derive(Clone)]
pub struct StoreQueue {
    jobs: mpsc::Sender<StoreJob>,
    control: mpsc::UnboundedSender<StoreMsg>,
}

/// Receiving side of a partition's store queue
pub struct StoreInbox {
    jobs: mpsc::Receiver<StoreJob>,
    control: mpsc::UnboundedReceiver<StoreMsg>,
}

/// Create a store queue holding at most `depth` pending store jobs
pub fn store_queue(depth: usize) -> (StoreQueue, StoreInbox) {
    let (jobs_tx, jobs_rx) = mpsc::channel(depth.max(1));
    let (control_tx, control_rx) = mpsc::unbounded_channel();
    (
        StoreQueue {
            jobs: jobs_tx,
            control: control_tx,
        },
        StoreInbox {
            jobs: jobs_rx,
            control: control_rx,
        },
    )
}

impl StoreQueue {
    /// Hand a message to the worker without blocking
    pub fn send(&self, msg: StoreMsg) -> Result<()> {
        match msg {
            StoreMsg::Store(job) => self.jobs.try_send(job).map_err(|e| match e {
                mpsc::error::TrySendError::Full(job) => Error::Internal(format!(
                    "store queue full, dropped job at index {}",
                    job.apply_index
                )),
                mpsc::error::TrySendError::Closed(_) => Error::ShuttingDown,
            }),
            control => self.control.send(control).map_err(|_| Error::ShuttingDown),
        }
    }
}

impl StoreInbox {
    /// Next message, control messages first; `None` once every sender is gone
    pub async fn recv(&mut self) -> Option<StoreMsg> {
        tokio::select! {
            biased;

            Some(msg) = self.control.recv() => Some(msg),
            Some(job) = self.jobs.recv() => Some(StoreMsg::Store(job)),
            else => None,
        }
    }

    /// Next message already queued, control messages first
    pub fn try_recv(&mut self) -> Option<StoreMsg> {
        if let Ok(msg) = self.control.try_recv() {
            return Some(msg);
        }
        self.jobs.try_recv().ok().map(StoreMsg::Store)
    }
}

/// CRC32 of the inode and dentry streams
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SnapshotSign {
    pub inode_crc: u32,
    pub dentry_crc: u32,
}

impl SnapshotSign {
    pub fn encode(&self) -> String {
        format!("{} {}", self.inode_crc, self.dentry_crc)
    }

    pub fn parse(text: &str) -> Option<Self> {
        let mut parts = text.split_whitespace();
        let inode_crc = parts.next()?.parse().ok()?;
        let dentry_crc = parts.next()?.parse().ok()?;
        if parts.next().is_some() {
            return None;
        }
        Some(Self {
            inode_crc,
            dentry_crc,
        })
    }
}

/// Write a length-prefixed record stream, returning the running CRC32
fn write_stream<'a, T, I>(path: &Path, records: I) -> Result<u32>
where
    T: Serialize + 'a,
    I: Iterator<Item = &'a T>,
{
    let file = File::create(path)?;
    let mut writer = BufWriter::new(file);
    let mut hasher = crc32fast::Hasher::new();

    for record in records {
        let data = bincode::serialize(record)?;
        let len = u32::try_from(data.len())
            .map_err(|_| Error::Internal(format!("record of {} bytes too large", data.len())))?;

        writer.write_u32::<BigEndian>(len)?;
        writer.write_all(&data)?;
        hasher.update(&len.to_be_bytes());
        hasher.update(&data);
    }

    writer.flush()?;
    writer.get_ref().sync_all()?;
    Ok(hasher.finalize())
}

fn write_text(path: &Path, text: &str) -> Result<()> {
    let mut file = File::create(path)?;
    file.write_all(text.as_bytes())?;
    file.sync_all()?;
    Ok(())
}

/// Persist a store job under `partition_dir`
pub fn store_snapshot(partition_dir: &Path, job: &StoreJob) -> Result<SnapshotSign> {
    let tmp = partition_dir.join(SNAPSHOT_TMP_DIR);
    if tmp.exists() {
        fs::remove_dir_all(&tmp)?;
    }
    fs::create_dir_all(&tmp)?;

    let inode_crc = write_stream(&tmp.join(INODE_FILE), job.inodes.values())?;
    let dentry_crc = write_stream(&tmp.join(DENTRY_FILE), job.dentries.values())?;
    write_text(
        &tmp.join(APPLY_FILE),
        &format!("{}|{}", job.apply_index, job.cursor),
    )?;

    let sign = SnapshotSign {
        inode_crc,
        dentry_crc,
    };
    write_text(&tmp.join(SIGN_FILE), &sign.encode())?;

    let current = partition_dir.join(SNAPSHOT_DIR);
    let backup = partition_dir.join(SNAPSHOT_BACKUP_DIR);
    if backup.exists() {
        fs::remove_dir_all(&backup)?;
    }
    if current.exists() {
        fs::rename(&current, &backup)?;
    }
    fs::rename(&tmp, &current)?;
    if backup.exists() {
        fs::remove_dir_all(&backup)?;
    }

    Ok(sign)
}

/// Keep whichever job is newest and still ahead of what is on disk
fn coalesce(pending: &mut Option<StoreJob>, job: StoreJob, last_stored: u64) {
    if job.apply_index <= last_stored {
        tracing::debug!(
            "Dropping store job at {} (stored {})",
            job.apply_index,
            last_stored
        );
        return;
    }
    match pending {
        Some(current) if current.apply_index >= job.apply_index => {}
        _ => *pending = Some(job),
    }
}

type StoreOutcome = (StoreJob, Result<SnapshotSign>);

/// Handle for stopping a running persistence worker
pub struct StoreHandle {
    shutdown: watch::Sender<bool>,
    task: JoinHandle<()>,
}

impl StoreHandle {
    /// Stop the worker, letting an in-flight store finish first
    pub async fn stop(self) {
        let _ = self.shutdown.send(true);
        if let Err(e) = self.task.await {
            tracing::warn!("Store worker ended abnormally: {}", e);
        }
    }
}

/// Background consumer of one partition's store queue
pub struct StoreWorker {
    partition_id: u64,
    dir: PathBuf,
    inbox: StoreInbox,
    engine: Arc<dyn ReplicationEngine<ApplyResult>>,
    progress: Arc<FsmProgress>,
    settings: PartitionSettings,
    shutdown: watch::Receiver<bool>,
}

impl StoreWorker {
    /// Spawn the worker onto the current runtime
    pub fn spawn(
        partition_id: u64,
        dir: PathBuf,
        inbox: StoreInbox,
        engine: Arc<dyn ReplicationEngine<ApplyResult>>,
        progress: Arc<FsmProgress>,
        settings: PartitionSettings,
    ) -> StoreHandle {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let worker = Self {
            partition_id,
            dir,
            inbox,
            engine,
            progress,
            settings,
            shutdown: shutdown_rx,
        };
        let task = tokio::spawn(worker.run());
        StoreHandle {
            shutdown: shutdown_tx,
            task,
        }
    }

    async fn run(mut self) {
        let mut pending: Option<StoreJob> = None;
        let mut in_flight: Option<JoinHandle<StoreOutcome>> = None;
        let mut last_stored = self.progress.stored_index();
        let mut ticking = false;
        let mut destroy = false;

        let mut ticker = tokio::time::interval(self.settings.store_interval());
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        ticker.reset();

        tracing::debug!("Store worker for partition {} started", self.partition_id);

        loop {
            // queued messages (including Destroy) before shutdown
            tokio::select! {
                biased;

                msg = self.inbox.recv() => {
                    let Some(msg) = msg else { break };
                    let mut batch = vec![msg];
                    while let Some(next) = self.inbox.try_recv() {
                        batch.push(next);
                    }
                    for msg in batch {
                        match msg {
                            StoreMsg::Store(job) => coalesce(&mut pending, job, last_stored),
                            StoreMsg::PersistConfig(config) => self.persist_config(config).await,
                            StoreMsg::StartTick => {
                                if !ticking {
                                    ticking = true;
                                    ticker.reset();
                                    tracing::debug!("Partition {} store tick started", self.partition_id);
                                }
                            }
                            StoreMsg::StopTick => {
                                if ticking {
                                    ticking = false;
                                    tracing::debug!("Partition {} store tick stopped", self.partition_id);
                                }
                            }
                            StoreMsg::Destroy => destroy = true,
                        }
                    }
                    if destroy {
                        break;
                    }
                }
                _ = ticker.tick(), if ticking => {
                    self.propose_store_tick(last_stored);
                }
                Some(joined) = OptionFuture::from(in_flight.as_mut()), if in_flight.is_some() => {
                    in_flight = None;
                    match joined {
                        Ok((job, Ok(sign))) => {
                            last_stored = job.apply_index;
                            self.progress.set_stored_index(last_stored);
                            self.engine.truncate(last_stored);
                            tracing::info!(
                                "Partition {} stored snapshot at index {} (crc {})",
                                self.partition_id,
                                last_stored,
                                sign.encode()
                            );
                        }
                        Ok((job, Err(e))) => {
                            tracing::warn!(
                                "Partition {} failed to store snapshot at index {}: {}, retrying",
                                self.partition_id,
                                job.apply_index,
                                e
                            );
                            coalesce(&mut pending, job, last_stored);
                        }
                        Err(e) => {
                            tracing::error!("Partition {} store task panicked: {}", self.partition_id, e);
                        }
                    }
                }
                _ = self.shutdown.changed() => {
                    if *self.shutdown.borrow() {
                        break;
                    }
                }
            }

            if in_flight.is_none() {
                if let Some(job) = pending.take() {
                    in_flight = Some(self.spawn_store(job));
                }
            }
        }

        if let Some(task) = in_flight.take() {
            match task.await {
                Ok((job, Ok(_))) => {
                    self.progress.set_stored_index(job.apply_index);
                    self.engine.truncate(job.apply_index);
                }
                Ok((job, Err(e))) => {
                    tracing::warn!(
                        "Partition {} snapshot at index {} not stored before shutdown: {}",
                        self.partition_id,
                        job.apply_index,
                        e
                    );
                }
                Err(e) => tracing::error!("Partition {} store task panicked: {}", self.partition_id, e),
            }
        }

        if destroy {
            let dir = self.dir.clone();
            match tokio::task::spawn_blocking(move || fs::remove_dir_all(dir)).await {
                Ok(Ok(())) => tracing::info!("Partition {} directory removed", self.partition_id),
                Ok(Err(e)) => tracing::error!("Partition {} directory removal failed: {}", self.partition_id, e),
                Err(e) => tracing::error!("Partition {} removal task panicked: {}", self.partition_id, e),
            }
        }

        tracing::debug!("Store worker for partition {} stopped", self.partition_id);
    }

    fn spawn_store(&self, job: StoreJob) -> JoinHandle<StoreOutcome> {
        let dir = self.dir.clone();
        let retry_delay = self.settings.store_retry_delay();
        tokio::spawn(async move {
            let outcome = tokio::task::spawn_blocking(move || {
                let result = store_snapshot(&dir, &job);
                (job, result)
            })
            .await;

            match outcome {
                Ok((job, Ok(sign))) => (job, Ok(sign)),
                Ok((job, Err(e))) => {
                    tokio::time::sleep(retry_delay).await;
                    (job, Err(e))
                }
                Err(e) => std::panic::resume_unwind(e.into_panic()),
            }
        })
    }

    fn propose_store_tick(&self, last_stored: u64) {
        if !self.engine.is_leader() || self.progress.applied_index() <= last_stored {
            return;
        }

        let engine = Arc::clone(&self.engine);
        let partition_id = self.partition_id;
        tokio::spawn(async move {
            let result = match MetaItem::StoreTick.encode() {
                Ok(data) => engine.submit(data).await.map(|_| ()),
                Err(e) => Err(e),
            };
            if let Err(e) = result {
                tracing::warn!("Partition {} store tick proposal failed: {}", partition_id, e);
            }
        });
    }

    async fn persist_config(&self, mut config: PartitionConfig) {
        config.root_dir = self.dir.clone();
        let partition_id = self.partition_id;
        match tokio::task::spawn_blocking(move || config.persist()).await {
            Ok(Ok(())) => tracing::debug!("Partition {} configuration persisted", partition_id),
            Ok(Err(e)) => tracing::error!("Partition {} configuration persist failed: {}", partition_id, e),
            Err(e) => tracing::error!("Partition {} persist task panicked: {}", partition_id, e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metadata::inode::{S_IFDIR, S_IFREG};
    use parking_lot::Mutex;
    use std::time::Duration;
    use tempfile::tempdir;

    #[derive(Default)]
    struct RecordingEngine {
        truncated: Mutex<Vec<u64>>,
        submitted: Mutex<usize>,
    }

    #[async_trait::async_trait]
    impl ReplicationEngine<ApplyResult> for RecordingEngine {
        async fn submit(&self, _data: Vec<u8>) -> Result<ApplyResult> {
            *self.submitted.lock() += 1;
            Ok(ApplyResult::ok())
        }

        fn truncate(&self, index: u64) {
            self.truncated.lock().push(index);
        }

        fn is_leader(&self) -> bool {
            true
        }

        fn leader(&self) -> Option<String> {
            None
        }
    }

    fn job(index: u64) -> StoreJob {
        let mut inodes = IndexedTree::new();
        inodes.insert(1, Inode::new(1, S_IFDIR, 0));
        inodes.insert(2, Inode::new(2, S_IFREG, 0));
        let mut dentries = IndexedTree::new();
        let dentry = Dentry::new(1, "file", 2, S_IFREG);
        dentries.insert(dentry.key(), dentry);
        StoreJob {
            apply_index: index,
            cursor: 2,
            inodes,
            dentries,
        }
    }

    async fn wait_for<F: Fn() -> bool>(check: F) {
        for _ in 0..200 {
            if check() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("condition not reached");
    }

    #[test]
    fn test_store_writes_all_files() {
        let dir = tempdir().unwrap();
        let sign = store_snapshot(dir.path(), &job(7)).unwrap();

        let snapshot = dir.path().join(SNAPSHOT_DIR);
        for name in [INODE_FILE, DENTRY_FILE, APPLY_FILE, SIGN_FILE] {
            assert!(snapshot.join(name).exists(), "{} missing", name);
        }
        assert_eq!(fs::read_to_string(snapshot.join(APPLY_FILE)).unwrap(), "7|2");
        assert_eq!(
            SnapshotSign::parse(&fs::read_to_string(snapshot.join(SIGN_FILE)).unwrap()),
            Some(sign)
        );
        assert!(!dir.path().join(SNAPSHOT_TMP_DIR).exists());
        assert!(!dir.path().join(SNAPSHOT_BACKUP_DIR).exists());

        // a second store replaces the first
        store_snapshot(dir.path(), &job(9)).unwrap();
        assert_eq!(fs::read_to_string(snapshot.join(APPLY_FILE)).unwrap(), "9|2");
    }

    #[test]
    fn test_coalesce_keeps_highest_index() {
        let mut pending = None;
        coalesce(&mut pending, job(10), 0);
        coalesce(&mut pending, job(25), 0);
        coalesce(&mut pending, job(12), 0);
        assert_eq!(pending.as_ref().map(|j| j.apply_index), Some(25));

        let mut pending = None;
        coalesce(&mut pending, job(5), 5);
        assert!(pending.is_none());
    }

    #[tokio::test]
    async fn test_worker_stores_only_latest_queued_job() {
        let dir = tempdir().unwrap();
        let (queue, inbox) = store_queue(5);
        queue.send(StoreMsg::Store(job(10))).unwrap();
        queue.send(StoreMsg::Store(job(25))).unwrap();

        let engine = Arc::new(RecordingEngine::default());
        let progress = Arc::new(FsmProgress::default());
        let handle = StoreWorker::spawn(
            1,
            dir.path().to_path_buf(),
            inbox,
            engine.clone(),
            progress.clone(),
            PartitionSettings::default(),
        );

        wait_for(|| !engine.truncated.lock().is_empty()).await;
        handle.stop().await;

        assert_eq!(*engine.truncated.lock(), vec![25]);
        assert_eq!(progress.stored_index(), 25);
        let apply = fs::read_to_string(dir.path().join(SNAPSHOT_DIR).join(APPLY_FILE)).unwrap();
        assert_eq!(apply, "25|2");
    }

    #[tokio::test]
    async fn test_failed_store_is_retried() {
        let dir = tempdir().unwrap();
        // a file where the partition directory should be makes every store fail
        let blocked = dir.path().join("partition_1");
        fs::write(&blocked, b"not a directory").unwrap();

        let (queue, inbox) = store_queue(5);
        let engine = Arc::new(RecordingEngine::default());
        let settings = PartitionSettings {
            store_retry_delay_ms: 20,
            ..PartitionSettings::default()
        };
        let handle = StoreWorker::spawn(
            1,
            blocked.clone(),
            inbox,
            engine.clone(),
            Arc::new(FsmProgress::default()),
            settings,
        );

        queue.send(StoreMsg::Store(job(3))).unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(engine.truncated.lock().is_empty());

        fs::remove_file(&blocked).unwrap();
        fs::create_dir_all(&blocked).unwrap();
        wait_for(|| !engine.truncated.lock().is_empty()).await;
        handle.stop().await;

        assert_eq!(*engine.truncated.lock(), vec![3]);
    }

    #[tokio::test]
    async fn test_destroy_removes_directory() {
        let dir = tempdir().unwrap();
        let partition = dir.path().join("partition_4");
        fs::create_dir_all(&partition).unwrap();

        let (queue, inbox) = store_queue(5);
        let handle = StoreWorker::spawn(
            4,
            partition.clone(),
            inbox,
            Arc::new(RecordingEngine::default()),
            Arc::new(FsmProgress::default()),
            PartitionSettings::default(),
        );

        queue.send(StoreMsg::Destroy).unwrap();
        wait_for(|| !partition.exists()).await;
        handle.stop().await;
    }

    #[tokio::test]
    async fn test_control_messages_survive_full_job_queue() {
        let (queue, mut inbox) = store_queue(2);
        queue.send(StoreMsg::Store(job(1))).unwrap();
        queue.send(StoreMsg::Store(job(2))).unwrap();
        assert!(queue.send(StoreMsg::Store(job(3))).is_err());

        let mut config = PartitionConfig::new(1, "ltptest", 1, 100);
        config.end = 500;
        queue.send(StoreMsg::PersistConfig(config)).unwrap();
        queue.send(StoreMsg::Destroy).unwrap();

        let names: Vec<_> = std::iter::from_fn(|| inbox.try_recv())
            .map(|msg| msg.name())
            .collect();
        assert_eq!(names, vec!["PersistConfig", "Destroy", "Store", "Store"]);
    }

    #[tokio::test]
    async fn test_inbox_closes_with_senders() {
        let (queue, mut inbox) = store_queue(2);
        queue.send(StoreMsg::StartTick).unwrap();
        drop(queue);

        assert!(matches!(inbox.recv().await, Some(StoreMsg::StartTick)));
        assert!(inbox.recv().await.is_none());
    }
}
