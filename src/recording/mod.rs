pub mod frame;

use crate::cluster::CommittedClusterTransaction;
use crate::commit::batch::{Batch, BatchResult};
use crate::commit::command::{CommandReply, WriteCommand};
use crate::commit::executor::{MergedWork, TransactionMerger, now_micros};
use crate::error::MergeDbError;
use frame::{FrameError, FrameReader, FrameWriter, RecordFrame};
use futures::Stream;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs::{File, OpenOptions};
use std::io::{self, BufReader, BufWriter, Read, Write};
use std::path::{Path, PathBuf};
use tracing::info;

const RECORDING_MAGIC: &[u8; 8] = b"MRGDBREC";
const RECORDING_VERSION: u32 = 1;

const ENTRY_BATCH: u8 = 1;
const ENTRY_CLUSTER_TRANSACTION: u8 = 2;

impl From<FrameError> for MergeDbError {
    fn from(value: FrameError) -> Self {
        match value {
            FrameError::Io(message) => MergeDbError::Io(io::Error::other(message)),
            other => MergeDbError::Decode(other.to_string()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecordedAttachment {
    pub hash: String,
    pub bytes: Vec<u8>,
}

/// A batch as it executed: generated ids resolved, expected change vectors
/// dropped and attachment content carried inline.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecordedBatch {
    pub commands: Vec<WriteCommand>,
    pub attachments: Vec<RecordedAttachment>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum RecordedEntry {
    Batch(RecordedBatch),
    ClusterTransaction(CommittedClusterTransaction),
}

impl RecordedEntry {
    pub(crate) fn from_executed_batch(
        batch: &Batch,
        result: &BatchResult,
        separator: char,
    ) -> Result<Self, MergeDbError> {
        let mut commands = Vec::with_capacity(batch.len());
        let mut attachments: BTreeMap<String, Vec<u8>> = BTreeMap::new();
        let mut last_put_id: Option<String> = None;
        for (command, reply) in batch.commands().iter().zip(&result.replies) {
            let mut command = command.clone();
            command.strip_expected_change_vector();
            match (&mut command, reply) {
                (WriteCommand::Put(put), CommandReply::Put(reply)) => {
                    put.id = reply.id.clone();
                    put.must_be_new = false;
                    last_put_id = Some(reply.id.clone());
                }
                (WriteCommand::AttachmentPut(put), _) => {
                    resolve_prefix(&mut put.document_id, last_put_id.as_deref(), separator);
                    if !attachments.contains_key(&put.stream.hash) {
                        let bytes = batch.attachment_bytes(&put.stream)?;
                        attachments.insert(put.stream.hash.clone(), bytes);
                    }
                }
                (WriteCommand::AttachmentDelete(delete), _) => {
                    resolve_prefix(&mut delete.document_id, last_put_id.as_deref(), separator);
                }
                (
                    WriteCommand::AttachmentMove(transfer) | WriteCommand::AttachmentCopy(transfer),
                    _,
                ) => {
                    resolve_prefix(&mut transfer.document_id, last_put_id.as_deref(), separator);
                }
                _ => {}
            }
            commands.push(command);
        }
        Ok(RecordedEntry::Batch(RecordedBatch {
            commands,
            attachments: attachments
                .into_iter()
                .map(|(hash, bytes)| RecordedAttachment { hash, bytes })
                .collect(),
        }))
    }

    pub fn command_count(&self) -> usize {
        match self {
            RecordedEntry::Batch(batch) => batch.commands.len(),
            RecordedEntry::ClusterTransaction(entry) => entry.proposal.commands.len(),
        }
    }

    fn entry_type(&self) -> u8 {
        match self {
            RecordedEntry::Batch(_) => ENTRY_BATCH,
            RecordedEntry::ClusterTransaction(_) => ENTRY_CLUSTER_TRANSACTION,
        }
    }

    /// Rebuilds the work item, spilling inline attachments into a fresh file.
    pub(crate) fn into_work(self) -> Result<MergedWork, MergeDbError> {
        match self {
            RecordedEntry::ClusterTransaction(entry) => Ok(MergedWork::ClusterTransaction(entry)),
            RecordedEntry::Batch(recorded) => {
                let contents: BTreeMap<String, Vec<u8>> = recorded
                    .attachments
                    .into_iter()
                    .map(|a| (a.hash, a.bytes))
                    .collect();
                let mut batch = Batch::new(Vec::with_capacity(recorded.commands.len()));
                for mut command in recorded.commands {
                    if let WriteCommand::AttachmentPut(put) = &mut command {
                        let bytes = contents.get(&put.stream.hash).ok_or_else(|| {
                            MergeDbError::Decode(format!(
                                "recorded attachment {} has no content",
                                put.stream.hash
                            ))
                        })?;
                        put.stream = batch.add_attachment_stream(bytes.as_slice())?;
                    }
                    batch.push(command);
                }
                Ok(MergedWork::Batch(batch))
            }
        }
    }
}

fn resolve_prefix(document_id: &mut String, last_put_id: Option<&str>, separator: char) {
    if !document_id.ends_with(separator) {
        return;
    }
    if let Some(id) = last_put_id
        && id.to_lowercase().starts_with(&document_id.to_lowercase())
    {
        *document_id = id.to_string();
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordingSummary {
    pub path: PathBuf,
    pub entries: u64,
    pub commands: u64,
}

/// Appends executed work to a recording file. The file is created fresh;
/// an existing file or directory at the path is refused.
pub struct TransactionRecorder {
    path: PathBuf,
    writer: FrameWriter<BufWriter<File>>,
    entries: u64,
    commands: u64,
}

impl TransactionRecorder {
    pub fn create(path: &Path) -> Result<Self, MergeDbError> {
        if path.is_dir() {
            return Err(MergeDbError::Validation(format!(
                "recording path {} is a directory",
                path.display()
            )));
        }
        let file = OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(path)
            .map_err(|e| match e.kind() {
                io::ErrorKind::AlreadyExists => MergeDbError::Validation(format!(
                    "recording file {} already exists",
                    path.display()
                )),
                _ => MergeDbError::Io(e),
            })?;
        let mut writer = BufWriter::new(file);
        writer.write_all(RECORDING_MAGIC)?;
        writer.write_all(&RECORDING_VERSION.to_be_bytes())?;
        writer.flush()?;
        Ok(Self {
            path: path.to_path_buf(),
            writer: FrameWriter::new(writer),
            entries: 0,
            commands: 0,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn append(&mut self, entry: &RecordedEntry) -> Result<(), MergeDbError> {
        let payload =
            rmp_serde::to_vec_named(entry).map_err(|e| MergeDbError::Encode(e.to_string()))?;
        self.entries += 1;
        self.commands += entry.command_count() as u64;
        self.writer.append(&RecordFrame {
            sequence: self.entries,
            timestamp_micros: now_micros(),
            entry_type: entry.entry_type(),
            payload,
        })?;
        Ok(())
    }

    pub fn flush(&mut self) -> Result<(), MergeDbError> {
        self.writer.flush()?;
        Ok(())
    }

    pub fn finish(mut self) -> Result<RecordingSummary, MergeDbError> {
        self.writer.flush()?;
        self.writer.get_ref().get_ref().sync_all()?;
        info!(
            path = %self.path.display(),
            entries = self.entries,
            commands = self.commands,
            "recording stopped"
        );
        Ok(RecordingSummary {
            path: self.path,
            entries: self.entries,
            commands: self.commands,
        })
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct RecordedFrame {
    pub sequence: u64,
    pub timestamp_micros: u64,
    pub entry: RecordedEntry,
}

pub struct RecordingReader {
    frames: FrameReader<BufReader<File>>,
}

impl RecordingReader {
    pub fn open(path: &Path) -> Result<Self, MergeDbError> {
        let mut reader = BufReader::new(File::open(path)?);
        let mut magic = [0u8; 8];
        let mut version = [0u8; 4];
        reader
            .read_exact(&mut magic)
            .and_then(|_| reader.read_exact(&mut version))
            .map_err(|_| {
                MergeDbError::Decode(format!("{} is not a recording file", path.display()))
            })?;
        if &magic != RECORDING_MAGIC {
            return Err(MergeDbError::Decode(format!(
                "{} is not a recording file",
                path.display()
            )));
        }
        let version = u32::from_be_bytes(version);
        if version != RECORDING_VERSION {
            return Err(MergeDbError::Decode(format!(
                "unsupported recording version {version}"
            )));
        }
        Ok(Self {
            frames: FrameReader::new(reader),
        })
    }

    pub fn next_entry(&mut self) -> Result<Option<RecordedFrame>, MergeDbError> {
        let Some(frame) = self.frames.next_frame()? else {
            return Ok(None);
        };
        let entry: RecordedEntry = rmp_serde::from_slice(&frame.payload)
            .map_err(|e| MergeDbError::Decode(e.to_string()))?;
        if entry.entry_type() != frame.entry_type {
            return Err(MergeDbError::Decode(format!(
                "entry {} has type {} but frame says {}",
                frame.sequence,
                entry.entry_type(),
                frame.entry_type
            )));
        }
        Ok(Some(RecordedFrame {
            sequence: frame.sequence,
            timestamp_micros: frame.timestamp_micros,
            entry,
        }))
    }
}

impl Iterator for RecordingReader {
    type Item = Result<RecordedFrame, MergeDbError>;

    fn next(&mut self) -> Option<Self::Item> {
        self.next_entry().transpose()
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReplayProgress {
    pub entries: u64,
    pub commands: u64,
    pub done: bool,
}

struct ReplayState {
    merger: TransactionMerger,
    reader: Option<RecordingReader>,
    path: PathBuf,
    interval: u64,
    progress: ReplayProgress,
    since_report: u64,
}

/// Re-enqueues every recorded entry, yielding progress each `interval`
/// commands and once more when the file is exhausted. The stream ends after
/// the first error.
pub fn replay(
    merger: TransactionMerger,
    path: PathBuf,
    interval: u64,
) -> impl Stream<Item = Result<ReplayProgress, MergeDbError>> {
    let state = ReplayState {
        merger,
        reader: None,
        path,
        interval: interval.max(1),
        progress: ReplayProgress::default(),
        since_report: 0,
    };
    futures::stream::unfold(Some(state), |state| async move {
        let mut state = state?;
        match replay_step(&mut state).await {
            Ok(progress) if progress.done => Some((Ok(progress), None)),
            Ok(progress) => Some((Ok(progress), Some(state))),
            Err(err) => Some((Err(err), None)),
        }
    })
}

async fn replay_step(state: &mut ReplayState) -> Result<ReplayProgress, MergeDbError> {
    if state.reader.is_none() {
        state.reader = Some(RecordingReader::open(&state.path)?);
    }
    loop {
        let next = match state.reader.as_mut() {
            Some(reader) => reader.next_entry()?,
            None => None,
        };
        let Some(frame) = next else {
            state.progress.done = true;
            info!(
                path = %state.path.display(),
                entries = state.progress.entries,
                commands = state.progress.commands,
                "replay finished"
            );
            return Ok(state.progress);
        };
        let commands = frame.entry.command_count() as u64;
        state.merger.enqueue_work(frame.entry.into_work()?).await?;
        state.progress.entries += 1;
        state.progress.commands += commands;
        state.since_report += commands;
        if state.since_report >= state.interval {
            state.since_report = 0;
            return Ok(state.progress);
        }
    }
}

/// Reads every entry of a recording, for inspection.
pub fn read_recording(path: &Path) -> Result<Vec<RecordedFrame>, MergeDbError> {
    RecordingReader::open(path)?.collect()
}
