use std::path::{Path, PathBuf};

use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::error::Result;
use crate::types::{now_ms, ConversationRecord};

enum StoreCommand {
    Write(Box<ConversationRecord>),
    Delete(String),
}

/// One JSON file per conversation under a dedicated directory.
///
/// Writes go through a single background task so updates to the same file
/// are never interleaved; a failed write is logged and the initiating
/// operation proceeds. Deletes follow the same path.
pub struct ConversationStore {
    dir: PathBuf,
    tx: mpsc::UnboundedSender<StoreCommand>,
}

impl ConversationStore {
    /// Create the directory if needed and start the writer task.
    pub fn open(dir: impl Into<PathBuf>) -> Result<Self> {
        let dir = dir.into();
        std::fs::create_dir_all(&dir)?;

        let (tx, rx) = mpsc::unbounded_channel();
        tokio::spawn(writer_loop(dir.clone(), rx));

        Ok(Self { dir, tx })
    }

    /// Queue a whole-file rewrite of one conversation.
    pub fn write(&self, record: ConversationRecord) {
        let _ = self.tx.send(StoreCommand::Write(Box::new(record)));
    }

    /// Queue removal of one conversation's file.
    pub fn delete(&self, conversation_id: &str) {
        let _ = self
            .tx
            .send(StoreCommand::Delete(conversation_id.to_string()));
    }

    /// Synchronous startup scan: parse every file, delete the expired ones,
    /// return the records worth reloading.
    pub fn load_all(&self) -> Vec<ConversationRecord> {
        let now = now_ms();
        let mut records = Vec::new();

        let entries = match std::fs::read_dir(&self.dir) {
            Ok(e) => e,
            Err(e) => {
                warn!(dir = %self.dir.display(), error = %e, "cannot scan conversation directory");
                return records;
            }
        };

        for entry in entries.flatten() {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            match read_record(&path) {
                Ok(record) if record.is_expired(now) => {
                    debug!(conversation = %record.id, "dropping expired conversation on load");
                    if let Err(e) = std::fs::remove_file(&path) {
                        warn!(path = %path.display(), error = %e, "failed to delete expired conversation");
                    }
                }
                Ok(record) => records.push(record),
                Err(e) => {
                    warn!(path = %path.display(), error = %e, "skipping unparsable conversation file");
                }
            }
        }

        info!(count = records.len(), "conversations loaded from disk");
        records
    }

    pub fn path_for(&self, conversation_id: &str) -> PathBuf {
        self.dir.join(format!("{conversation_id}.json"))
    }
}

fn read_record(path: &Path) -> Result<ConversationRecord> {
    let json = std::fs::read_to_string(path)?;
    Ok(serde_json::from_str(&json)?)
}

async fn writer_loop(dir: PathBuf, mut rx: mpsc::UnboundedReceiver<StoreCommand>) {
    while let Some(cmd) = rx.recv().await {
        match cmd {
            StoreCommand::Write(record) => {
                let path = dir.join(format!("{}.json", record.id));
                match serde_json::to_vec(&record) {
                    Ok(json) => {
                        if let Err(e) = tokio::fs::write(&path, json).await {
                            warn!(path = %path.display(), error = %e, "conversation write failed");
                        }
                    }
                    Err(e) => {
                        warn!(conversation = %record.id, error = %e, "conversation serialize failed")
                    }
                }
            }
            StoreCommand::Delete(id) => {
                let path = dir.join(format!("{id}.json"));
                match tokio::fs::remove_file(&path).await {
                    Ok(()) => {}
                    Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                    Err(e) => {
                        warn!(path = %path.display(), error = %e, "conversation delete failed")
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Conversation;
    use synapse_core::types::Message;

    async fn drain(store: &ConversationStore) {
        // The writer task is fed through an unbounded channel; give it a
        // few polls to flush before asserting on the filesystem.
        for _ in 0..10 {
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        }
        let _ = store;
    }

    #[tokio::test]
    async fn write_then_load_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let store = ConversationStore::open(dir.path()).unwrap();

        let conv = Conversation::new("tok".into(), None, 60_000);
        conv.append_messages(&[Message::user_text("hi")]);
        store.write(conv.snapshot());
        drain(&store).await;

        let records = store.load_all();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].id, conv.id());
        assert_eq!(records[0].history.len(), 1);
    }

    #[tokio::test]
    async fn load_all_deletes_expired_files() {
        let dir = tempfile::tempdir().unwrap();
        let store = ConversationStore::open(dir.path()).unwrap();

        let mut record = Conversation::new("tok".into(), None, 10).snapshot();
        record.last_access_ms -= 1_000;
        let path = store.path_for(&record.id);
        std::fs::write(&path, serde_json::to_vec(&record).unwrap()).unwrap();

        assert!(store.load_all().is_empty());
        assert!(!path.exists());
    }

    #[tokio::test]
    async fn delete_removes_file() {
        let dir = tempfile::tempdir().unwrap();
        let store = ConversationStore::open(dir.path()).unwrap();

        let conv = Conversation::new("tok".into(), None, 60_000);
        store.write(conv.snapshot());
        drain(&store).await;
        assert!(store.path_for(conv.id()).exists());

        store.delete(conv.id());
        drain(&store).await;
        assert!(!store.path_for(conv.id()).exists());
    }

    #[tokio::test]
    async fn unparsable_files_are_skipped() {
        let dir = tempfile::tempdir().unwrap();
        let store = ConversationStore::open(dir.path()).unwrap();
        std::fs::write(dir.path().join("garbage.json"), b"{not json").unwrap();
        assert!(store.load_all().is_empty());
    }
}
