use crate::change_vector::ChangeVector;
use crate::commit::command::{AttachmentPutCommand, AttachmentStream, CommandReply, WriteCommand};
use crate::error::MergeDbError;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::BTreeSet;
use std::fs::File;
use std::io::{Read, Seek, SeekFrom, Write};

const SPILL_CHUNK: usize = 64 * 1024;

/// Temporary file holding every attachment stream of one batch. The file is
/// unlinked on creation and disappears when the batch is dropped.
#[derive(Debug)]
pub struct AttachmentSpill {
    file: File,
    len: u64,
}

impl AttachmentSpill {
    pub fn new() -> Result<Self, MergeDbError> {
        Ok(Self {
            file: tempfile::tempfile()?,
            len: 0,
        })
    }

    /// Copies `reader` to the end of the spill file, hashing as it goes.
    pub fn append(&mut self, mut reader: impl Read) -> Result<AttachmentStream, MergeDbError> {
        let offset = self.len;
        self.file.seek(SeekFrom::Start(offset))?;
        let mut hasher = Sha256::new();
        let mut buf = vec![0u8; SPILL_CHUNK];
        let mut length = 0u64;
        loop {
            let read = reader.read(&mut buf)?;
            if read == 0 {
                break;
            }
            hasher.update(&buf[..read]);
            self.file.write_all(&buf[..read])?;
            length += read as u64;
        }
        self.len += length;
        Ok(AttachmentStream {
            offset,
            length,
            hash: hex::encode(hasher.finalize()),
        })
    }

    pub fn read(&self, stream: &AttachmentStream) -> Result<Vec<u8>, MergeDbError> {
        if stream.offset + stream.length > self.len {
            return Err(MergeDbError::Validation(format!(
                "attachment stream at {}+{} is outside the spill file",
                stream.offset, stream.length
            )));
        }
        let mut file = &self.file;
        file.seek(SeekFrom::Start(stream.offset))?;
        let mut bytes = vec![0u8; stream.length as usize];
        file.read_exact(&mut bytes)?;
        let hash = hex::encode(Sha256::digest(&bytes));
        if hash != stream.hash {
            return Err(MergeDbError::StorageFatal(format!(
                "attachment stream hash mismatch: expected {}, read {hash}",
                stream.hash
            )));
        }
        Ok(bytes)
    }

    pub fn len(&self) -> u64 {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }
}

/// Ordered commands executed atomically in one physical transaction.
#[derive(Debug, Default)]
pub struct Batch {
    commands: Vec<WriteCommand>,
    spill: Option<AttachmentSpill>,
}

impl Batch {
    pub fn new(commands: Vec<WriteCommand>) -> Self {
        Self {
            commands,
            spill: None,
        }
    }

    pub fn push(&mut self, command: WriteCommand) {
        self.commands.push(command);
    }

    /// Buffers the stream in the spill file and appends the matching
    /// attachment put.
    pub fn put_attachment(
        &mut self,
        document_id: impl Into<String>,
        name: impl Into<String>,
        content_type: impl Into<String>,
        content: impl Read,
    ) -> Result<AttachmentStream, MergeDbError> {
        let stream = self.add_attachment_stream(content)?;
        self.commands
            .push(WriteCommand::AttachmentPut(AttachmentPutCommand {
                document_id: document_id.into(),
                name: name.into(),
                content_type: content_type.into(),
                stream: stream.clone(),
                expected_change_vector: None,
            }));
        Ok(stream)
    }

    pub fn add_attachment_stream(
        &mut self,
        content: impl Read,
    ) -> Result<AttachmentStream, MergeDbError> {
        if self.spill.is_none() {
            self.spill = Some(AttachmentSpill::new()?);
        }
        match self.spill.as_mut() {
            Some(spill) => spill.append(content),
            None => Err(MergeDbError::Validation("attachment spill unavailable".into())),
        }
    }

    pub fn attachment_bytes(&self, stream: &AttachmentStream) -> Result<Vec<u8>, MergeDbError> {
        match &self.spill {
            Some(spill) => spill.read(stream),
            None if stream.length == 0 => Ok(Vec::new()),
            None => Err(MergeDbError::Validation(
                "batch has no attachment streams".into(),
            )),
        }
    }

    pub fn commands(&self) -> &[WriteCommand] {
        &self.commands
    }

    pub fn len(&self) -> usize {
        self.commands.len()
    }

    pub fn is_empty(&self) -> bool {
        self.commands.is_empty()
    }

    pub fn spilled_bytes(&self) -> u64 {
        self.spill.as_ref().map(AttachmentSpill::len).unwrap_or(0)
    }

    pub fn approximate_size(&self) -> usize {
        self.commands
            .iter()
            .map(WriteCommand::approximate_size)
            .sum()
    }

    /// Gives every auto-numbered put from `from_index` on a fresh,
    /// non-conflicting id. Returns how many commands were rewritten.
    pub(crate) fn regenerate_identities(
        &mut self,
        from_index: usize,
        separator: char,
        node_tag: &str,
    ) -> usize {
        let mut rebuilt = Vec::with_capacity(self.commands.len());
        let mut rewritten = 0;
        for (idx, command) in std::mem::take(&mut self.commands).into_iter().enumerate() {
            match command {
                WriteCommand::Put(mut put)
                    if idx >= from_index
                        && is_identity_template(&put.id, separator, put.must_be_new) =>
                {
                    let prefix = identity_prefix(&put.id, separator, put.must_be_new);
                    put.id = non_conflicting_id(prefix, node_tag);
                    put.must_be_new = true;
                    rewritten += 1;
                    rebuilt.push(WriteCommand::Put(put));
                }
                other => rebuilt.push(other),
            }
        }
        self.commands = rebuilt;
        rewritten
    }

    pub(crate) fn commands_mut(&mut self) -> &mut Vec<WriteCommand> {
        &mut self.commands
    }
}

/// Ids ending in the separator are server-numbered; so are ids already
/// regenerated once, which keep their prefix up to the last separator.
fn is_identity_template(id: &str, separator: char, must_be_new: bool) -> bool {
    id.ends_with(separator) || (must_be_new && id.contains(separator))
}

fn identity_prefix(id: &str, separator: char, must_be_new: bool) -> &str {
    if id.ends_with(separator) || !must_be_new {
        return id;
    }
    match id.rfind(separator) {
        Some(pos) => &id[..=pos],
        None => id,
    }
}

pub(crate) fn non_conflicting_id(prefix: &str, node_tag: &str) -> String {
    format!("{prefix}{}-{node_tag}", uuid::Uuid::new_v4().simple())
}

/// Outcome of one executed batch.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BatchResult {
    pub replies: Vec<CommandReply>,
    pub last_change_vector: Option<ChangeVector>,
    pub last_tombstone_etag: u64,
    pub modified_collections: BTreeSet<String>,
}

impl BatchResult {
    pub fn executed(&self) -> usize {
        self.replies.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn spill_round_trips_multiple_streams() {
        let mut batch = Batch::default();
        let first = batch
            .put_attachment("users/1", "a.txt", "text/plain", &b"hello"[..])
            .expect("first");
        let second = batch
            .add_attachment_stream(&vec![7u8; 200_000][..])
            .expect("second");
        assert_eq!(first.offset, 0);
        assert_eq!(second.offset, 5);
        assert_eq!(batch.attachment_bytes(&first).expect("read"), b"hello");
        assert_eq!(batch.attachment_bytes(&second).expect("read").len(), 200_000);
        assert_eq!(batch.spilled_bytes(), 200_005);
        assert_eq!(batch.len(), 1);
    }

    #[test]
    fn tampered_stream_reference_is_detected() {
        let mut batch = Batch::default();
        let mut stream = batch.add_attachment_stream(&b"abc"[..]).expect("spill");
        stream.hash = "00".repeat(32);
        let err = batch.attachment_bytes(&stream).expect_err("hash mismatch");
        assert!(matches!(err, MergeDbError::StorageFatal(_)));
    }

    #[test]
    fn regeneration_only_touches_later_auto_numbered_puts() {
        let mut batch = Batch::new(vec![
            WriteCommand::put("users/", json!({})),
            WriteCommand::put("users/1", json!({})),
            WriteCommand::put("users/", json!({})),
            WriteCommand::delete("users/"),
            WriteCommand::put("orders/", json!({})),
        ]);
        let rewritten = batch.regenerate_identities(1, '/', "A");
        assert_eq!(rewritten, 2);
        let ids: Vec<_> = batch
            .commands()
            .iter()
            .map(|cmd| match cmd {
                WriteCommand::Put(put) => (put.id.clone(), put.must_be_new),
                WriteCommand::Delete(del) => (del.id.clone(), false),
                _ => unreachable!(),
            })
            .collect();
        assert_eq!(ids[0], ("users/".to_string(), false));
        assert_eq!(ids[1], ("users/1".to_string(), false));
        assert!(ids[2].0.starts_with("users/") && ids[2].0.ends_with("-A") && ids[2].1);
        assert_eq!(ids[3], ("users/".to_string(), false));
        assert!(ids[4].0.starts_with("orders/") && ids[4].1);

        // a regenerated id that collides again is regenerated under the same prefix
        let again = batch.regenerate_identities(2, '/', "A");
        assert_eq!(again, 2);
        match &batch.commands()[2] {
            WriteCommand::Put(put) => assert!(put.id.starts_with("users/") && put.id != ids[2].0),
            _ => unreachable!(),
        }
    }
}
