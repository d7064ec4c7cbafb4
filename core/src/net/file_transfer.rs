//! Directory replication over the guaranteed channel.
//!
//! The sender announces the file count, creates every directory, streams each
//! file in chunks and finishes with `NET_DONE_SENDING_FILES`. The receiver
//! acknowledges each file once its last chunk is written.

use std::{
    collections::{BTreeSet, VecDeque},
    fs::{self, File, OpenOptions},
    io::{Read, Seek, SeekFrom, Write},
    path::{Component, Path, PathBuf},
};

use anyhow::{bail, Context};

use super::{
    messages::{FileChunk, Message},
    opcode::MessageType,
    transport::{Target, Transport},
};
use crate::constants::FILE_CHUNK_SIZE;

enum Outgoing {
    Message(Message),
    File {
        local: PathBuf,
        remote: String,
        size: u32,
        offset: u32,
    },
}

pub struct FileSender {
    queue: VecDeque<Outgoing>,
    unacknowledged: BTreeSet<String>,
}

impl FileSender {
    /// Queues the whole tree under `root`, to be recreated under `prefix` on
    /// the receiver.
    pub fn from_directory(root: &Path, prefix: &str) -> anyhow::Result<Self> {
        let mut directories = Vec::new();
        let mut files = Vec::new();
        collect_tree(root, prefix.trim_matches('/'), &mut directories, &mut files)
            .with_context(|| format!("walking {}", root.display()))?;

        let mut queue = VecDeque::new();
        queue.push_back(Outgoing::Message(Message::NumFilesToSend(files.len() as u32)));
        for directory in directories {
            queue.push_back(Outgoing::Message(Message::CreateDirectory(directory)));
        }

        let mut unacknowledged = BTreeSet::new();
        for (local, remote) in files {
            let len = fs::metadata(&local)
                .with_context(|| format!("reading metadata of {}", local.display()))?
                .len();
            let Ok(size) = u32::try_from(len) else {
                bail!("{} is too large to transfer", local.display());
            };
            unacknowledged.insert(remote.clone());
            queue.push_back(Outgoing::File {
                local,
                remote,
                size,
                offset: 0,
            });
        }
        queue.push_back(Outgoing::Message(Message::DoneSendingFiles));

        log::info!(
            "queued {} files from {} for transfer",
            unacknowledged.len(),
            root.display()
        );
        Ok(FileSender {
            queue,
            unacknowledged,
        })
    }

    /// Sends up to `max_messages` messages. Returns how many went out.
    pub fn pump<T: Transport>(
        &mut self,
        transport: &mut T,
        target: Target,
        max_messages: usize,
    ) -> anyhow::Result<usize> {
        let mut sent = 0;
        while sent < max_messages {
            let Some(message) = self.next_message()? else {
                break;
            };
            super::send_message(transport, &message, target)?;
            sent += 1;
        }
        Ok(sent)
    }

    fn next_message(&mut self) -> anyhow::Result<Option<Message>> {
        let Some(front) = self.queue.front_mut() else {
            return Ok(None);
        };
        let message = match front {
            Outgoing::Message(message) => message.clone(),
            Outgoing::File {
                local,
                remote,
                size,
                offset,
            } => {
                let chunk_len = (*size - *offset).min(FILE_CHUNK_SIZE as u32) as usize;
                let mut data = vec![0u8; chunk_len];
                let mut file =
                    File::open(&*local).with_context(|| format!("opening {}", local.display()))?;
                file.seek(SeekFrom::Start(*offset as u64))?;
                file.read_exact(&mut data)
                    .with_context(|| format!("reading {}", local.display()))?;

                let chunk = FileChunk {
                    path: remote.clone(),
                    total_size: *size,
                    offset: *offset,
                    data,
                };
                *offset += chunk_len as u32;
                if !chunk.is_last() {
                    // More chunks to come, the file stays at the front.
                    return Ok(Some(Message::TransferFile(chunk)));
                }
                Message::TransferFile(chunk)
            }
        };
        self.queue.pop_front();
        Ok(Some(message))
    }

    /// Records a `NET_TRANSFER_OK`.
    pub fn acknowledge(&mut self, path: &str) -> bool {
        self.unacknowledged.remove(path)
    }

    pub fn is_sent(&self) -> bool {
        self.queue.is_empty()
    }

    pub fn is_acknowledged(&self) -> bool {
        self.is_sent() && self.unacknowledged.is_empty()
    }
}

fn collect_tree(
    dir: &Path,
    remote: &str,
    directories: &mut Vec<String>,
    files: &mut Vec<(PathBuf, String)>,
) -> anyhow::Result<()> {
    if !remote.is_empty() {
        directories.push(remote.to_string());
    }
    let mut entries = fs::read_dir(dir)?.collect::<Result<Vec<_>, _>>()?;
    entries.sort_by_key(|entry| entry.file_name());

    let mut subdirs = Vec::new();
    for entry in entries {
        let name = entry.file_name().to_string_lossy().into_owned();
        let child = if remote.is_empty() {
            name
        } else {
            format!("{remote}/{name}")
        };
        if entry.file_type()?.is_dir() {
            subdirs.push((entry.path(), child));
        } else {
            files.push((entry.path(), child));
        }
    }
    for (path, child) in subdirs {
        collect_tree(&path, &child, directories, files)?;
    }
    Ok(())
}

/// Writes an incoming tree below `root`.
pub struct FileReceiver {
    root: PathBuf,
    expected_files: Option<u32>,
    files_received: u32,
    done: bool,
}

impl FileReceiver {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        FileReceiver {
            root: root.into(),
            expected_files: None,
            files_received: 0,
            done: false,
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn expected_files(&self) -> Option<u32> {
        self.expected_files
    }

    pub fn files_received(&self) -> u32 {
        self.files_received
    }

    /// Every announced file arrived and the sender said it is done.
    pub fn is_done(&self) -> bool {
        self.done && self.expected_files.map_or(true, |n| self.files_received >= n)
    }

    /// Maps a wire path to a location below the root, refusing anything that
    /// would escape it.
    pub fn resolve(&self, path: &str) -> anyhow::Result<PathBuf> {
        if path.is_empty() || path.contains('\\') {
            bail!("refusing path {:?}", path);
        }
        let mut resolved = self.root.clone();
        for component in Path::new(path).components() {
            match component {
                Component::Normal(part) => resolved.push(part),
                Component::CurDir => {}
                _ => bail!("refusing path {:?}", path),
            }
        }
        Ok(resolved)
    }

    /// Applies a file replication message. Returns the reply to send, if any.
    pub fn handle(&mut self, message: &Message) -> anyhow::Result<Option<Message>> {
        match message {
            Message::NumFilesToSend(count) => {
                log::info!("expecting {} files", count);
                self.expected_files = Some(*count);
                self.files_received = 0;
                self.done = false;
            }
            Message::CreateDirectory(path) => {
                let dir = self.resolve(path)?;
                fs::create_dir_all(&dir)
                    .with_context(|| format!("creating {}", dir.display()))?;
            }
            Message::TransferFile(chunk) => {
                self.write_chunk(chunk)?;
                if chunk.is_last() {
                    self.files_received += 1;
                    log::debug!("received {}", chunk.path);
                    return Ok(Some(Message::TransferOk(chunk.path.clone())));
                }
            }
            Message::DoneSendingFiles => {
                log::info!("file transfer done, {} files", self.files_received);
                self.done = true;
            }
            other => log::trace!("{:?} is not a file transfer message", other.kind()),
        }
        Ok(None)
    }

    fn write_chunk(&self, chunk: &FileChunk) -> anyhow::Result<()> {
        let path = self.resolve(&chunk.path)?;
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("creating {}", parent.display()))?;
        }
        let mut file = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(chunk.offset == 0)
            .open(&path)
            .with_context(|| format!("opening {}", path.display()))?;
        file.seek(SeekFrom::Start(chunk.offset as u64))?;
        file.write_all(&chunk.data)
            .with_context(|| format!("writing {}", path.display()))?;
        Ok(())
    }
}

/// True for the messages [`FileReceiver::handle`] consumes.
pub fn is_transfer_message(kind: MessageType) -> bool {
    matches!(
        kind,
        MessageType::NetNumFilesToSend
            | MessageType::NetCreateDirectory
            | MessageType::NetTransferFile
            | MessageType::NetDoneSendingFiles
    )
}

#[cfg(test)]
mod tests {
    use std::{
        fs,
        path::PathBuf,
        time::{SystemTime, UNIX_EPOCH},
    };

    use super::{FileReceiver, FileSender};
    use crate::{
        constants::FILE_CHUNK_SIZE,
        net::{
            loopback::LoopbackHub,
            messages::{FileChunk, Message},
            transport::{Target, Transport, TransportEvent},
        },
    };

    fn unique_temp_dir(prefix: &str) -> PathBuf {
        let pid = std::process::id();
        let nanos = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_nanos();
        std::env::temp_dir().join(format!("{prefix}_{pid}_{nanos}"))
    }

    #[test]
    fn resolve_confines_paths_to_root() {
        let receiver = FileReceiver::new("/tmp/ego_root");
        assert_eq!(
            receiver.resolve("players/bob/naming.txt").unwrap(),
            PathBuf::from("/tmp/ego_root/players/bob/naming.txt")
        );
        assert!(receiver.resolve("../etc/passwd").is_err());
        assert!(receiver.resolve("players/../../x").is_err());
        assert!(receiver.resolve("/etc/passwd").is_err());
        assert!(receiver.resolve("a\\b").is_err());
        assert!(receiver.resolve("").is_err());
    }

    #[test]
    fn tree_is_replicated_and_acknowledged() {
        let source = unique_temp_dir("ego_send");
        let target = unique_temp_dir("ego_recv");
        fs::create_dir_all(source.join("bob/inventory")).unwrap();
        fs::write(source.join("bob/naming.txt"), b"Bob the Brave").unwrap();
        let big: Vec<u8> = (0..FILE_CHUNK_SIZE * 2 + 17).map(|i| i as u8).collect();
        fs::write(source.join("bob/inventory/pack.dat"), &big).unwrap();
        fs::write(source.join("empty.txt"), b"").unwrap();

        let hub = LoopbackHub::new();
        let mut host = hub.host();
        let mut remote = hub.connect_remote();
        host.poll_events().unwrap();
        remote.poll_events().unwrap();

        let mut sender = FileSender::from_directory(&source, "import").unwrap();
        let mut receiver = FileReceiver::new(&target);
        while !sender.is_sent() {
            sender.pump(&mut host, Target::Broadcast, 2).unwrap();
        }

        for event in remote.poll_events().unwrap() {
            let TransportEvent::Received { payload, .. } = event else {
                continue;
            };
            let message = Message::decode(&payload).unwrap();
            if let Some(Message::TransferOk(path)) = receiver.handle(&message).unwrap() {
                assert!(sender.acknowledge(&path));
            }
        }

        assert!(receiver.is_done());
        assert_eq!(receiver.expected_files(), Some(3));
        assert!(sender.is_acknowledged());
        assert_eq!(
            fs::read(target.join("import/bob/naming.txt")).unwrap(),
            b"Bob the Brave"
        );
        assert_eq!(fs::read(target.join("import/bob/inventory/pack.dat")).unwrap(), big);
        assert!(target.join("import/empty.txt").exists());

        let _ = fs::remove_dir_all(&source);
        let _ = fs::remove_dir_all(&target);
    }

    #[test]
    fn escaping_chunk_is_refused() {
        let root = unique_temp_dir("ego_escape");
        let mut receiver = FileReceiver::new(&root);
        let chunk = FileChunk {
            path: "../escape.txt".to_string(),
            total_size: 1,
            offset: 0,
            data: vec![1],
        };
        assert!(receiver.handle(&Message::TransferFile(chunk)).is_err());
        assert_eq!(receiver.files_received(), 0);
    }
}
