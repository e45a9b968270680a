//! In-memory file store
//!
//! The filename to content map is owned by a single task. [`FileStore`] handles
//! talk to it over a command queue, so every get and put is applied in one
//! serialized turn and no caller ever sees a half-written entry.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::{mpsc, oneshot};

const COMMAND_QUEUE: usize = 64;

/// Immutable snapshot of a stored file
pub type Contents = Arc<[u8]>;

#[derive(Debug)]
enum Command {
    Get {
        filename: String,
        reply: oneshot::Sender<Option<Contents>>,
    },
    Put {
        filename: String,
        contents: Contents,
    },
    Count {
        reply: oneshot::Sender<usize>,
    },
}

/// Handle to the shared file store
///
/// Cheap to clone; all clones address the same files. The owning task stops
/// once the last handle is dropped.
#[derive(Debug, Clone)]
pub struct FileStore {
    commands: mpsc::Sender<Command>,
}

impl FileStore {
    /// Start an empty store.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn new() -> Self {
        let (commands, queue) = mpsc::channel(COMMAND_QUEUE);
        tokio::spawn(serve(queue));
        Self { commands }
    }

    /// Look up a file, returning `None` if it was never stored
    pub async fn get(&self, filename: &str) -> Option<Contents> {
        let (reply, response) = oneshot::channel();
        let command = Command::Get {
            filename: filename.to_string(),
            reply,
        };
        if self.commands.send(command).await.is_err() {
            tracing::error!("File store is no longer running");
            return None;
        }
        response.await.ok().flatten()
    }

    /// Store a file, replacing any previous content under the same name
    pub async fn put(&self, filename: impl Into<String>, contents: impl Into<Contents>) {
        let command = Command::Put {
            filename: filename.into(),
            contents: contents.into(),
        };
        if self.commands.send(command).await.is_err() {
            tracing::error!("File store is no longer running");
        }
    }

    /// Number of files currently stored
    pub async fn file_count(&self) -> usize {
        let (reply, response) = oneshot::channel();
        if self.commands.send(Command::Count { reply }).await.is_err() {
            return 0;
        }
        response.await.unwrap_or(0)
    }
}

impl Default for FileStore {
    fn default() -> Self {
        Self::new()
    }
}

async fn serve(mut queue: mpsc::Receiver<Command>) {
    let mut files: HashMap<String, Contents> = HashMap::new();

    while let Some(command) = queue.recv().await {
        match command {
            Command::Get { filename, reply } => {
                // The requester may have gone away; nothing to do then
                let _ = reply.send(files.get(&filename).cloned());
            }
            Command::Put { filename, contents } => {
                tracing::debug!("Stored '{}' ({} bytes)", filename, contents.len());
                files.insert(filename, contents);
            }
            Command::Count { reply } => {
                let _ = reply.send(files.len());
            }
        }
    }

    tracing::debug!("File store closed with {} files", files.len());
}
