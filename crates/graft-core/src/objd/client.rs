//! Request/response plumbing for every object-daemon opcode.

use std::os::unix::ffi::OsStrExt;
use std::path::Path;

use tokio::io::BufWriter;
use tokio::net::unix::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::UnixStream;
use tracing::debug;

use super::error::{ObjdError, ObjdResult, StatusError};
use super::types::{
    CommitDetail, CommitSummary, DiffChunk, EntryKind, FileDiff, Oid, PathEntry, RawTreeEntry,
    RepoIndex, Signature,
};
use crate::wire::{WireError, WireReader, WireResult, WireWriter};

const OP_INDEX: u64 = 1;
const OP_TREE_RAW: u64 = 2;
const OP_RESOLVE_REF: u64 = 3;
const OP_LIST_BRANCHES: u64 = 4;
const OP_FORMAT_PATCH: u64 = 5;
const OP_COMMIT_INFO: u64 = 6;
const OP_MERGE_BASE: u64 = 7;
const OP_LOG: u64 = 8;
const OP_TREE_LIST: u64 = 9;
const OP_WRITE_TREE: u64 = 10;
const OP_WRITE_BLOB: u64 = 11;
const OP_COMMIT_TREE: u64 = 12;
const OP_COMMIT_CREATE: u64 = 13;
const OP_UPDATE_REF: u64 = 14;
const OP_INIT_REPO: u64 = 15;

/// Result of a path lookup: either a directory listing or a file's bytes.
#[derive(Debug, Clone)]
pub enum PathContent {
    /// The path named a subtree.
    Tree(Vec<PathEntry>),
    /// The path named a blob.
    Blob(Vec<u8>),
}

/// Connection to the object daemon.
///
/// Owns one stream; one outstanding call at a time. See the module
/// documentation for the connection discipline.
pub struct Client {
    reader: WireReader<OwnedReadHalf>,
    writer: WireWriter<BufWriter<OwnedWriteHalf>>,
}

/// Maps a clean end-of-stream inside a response record to a protocol error;
/// only a record *boundary* may coincide with end-of-stream.
fn cut_short<T>(result: WireResult<T>) -> ObjdResult<T> {
    result.map_err(|e| match e {
        WireError::Eof => ObjdError::malformed("response record cut short"),
        other => ObjdError::Wire(other),
    })
}

fn utf8(bytes: Vec<u8>, what: &'static str) -> ObjdResult<String> {
    String::from_utf8(bytes).map_err(|_| ObjdError::malformed(format!("{what} is not UTF-8")))
}

fn lossy(bytes: Vec<u8>) -> String {
    String::from_utf8_lossy(&bytes).into_owned()
}

impl Client {
    /// Connects to the object daemon at `socket_path`.
    ///
    /// # Errors
    ///
    /// Returns [`ObjdError::Wire`] if the socket cannot be reached.
    pub async fn connect(socket_path: &Path) -> ObjdResult<Self> {
        let stream = UnixStream::connect(socket_path)
            .await
            .map_err(WireError::Io)?;
        debug!(socket = %socket_path.display(), "connected to object daemon");
        let (read_half, write_half) = stream.into_split();
        Ok(Self {
            reader: WireReader::new(read_half),
            writer: WireWriter::new(BufWriter::new(write_half)),
        })
    }

    /// Writes the per-call header: repository path, then opcode.
    async fn send_header(&mut self, repo: &Path, opcode: u64) -> ObjdResult<()> {
        self.writer.write_data(repo.as_os_str().as_bytes()).await?;
        self.writer.write_uint(opcode).await?;
        Ok(())
    }

    /// Flushes the request and reads the status word.
    ///
    /// A nonzero status is mapped through the fixed table and no result
    /// fields are read after it.
    async fn read_status(&mut self) -> ObjdResult<()> {
        self.writer.flush().await?;
        let status = self.reader.read_uint().await?;
        match StatusError::from_status(status) {
            None => Ok(()),
            Some(err) => Err(ObjdError::Status(err)),
        }
    }

    async fn read_oid(&mut self) -> ObjdResult<Oid> {
        let raw = cut_short(self.reader.read_data().await)?;
        Oid::from_bytes(&raw)
            .map_err(|_| ObjdError::malformed(format!("object id of {} bytes", raw.len())))
    }

    /// Opcode 1: repository index.
    ///
    /// Returns the readme (if any) and the recent-commit list. The commit
    /// list is terminated by end-of-stream, so this call consumes the
    /// client.
    pub async fn index(mut self, repo: &Path) -> ObjdResult<RepoIndex> {
        self.send_header(repo, OP_INDEX).await?;
        self.read_status().await?;

        let readme = match self.reader.read_data().await {
            Ok(bytes) => Some(bytes),
            Err(WireError::Eof) => {
                return Ok(RepoIndex {
                    readme: None,
                    commits: Vec::new(),
                })
            }
            Err(e) => return Err(e.into()),
        };

        let mut commits = Vec::new();
        loop {
            let id = match self.reader.read_data().await {
                Ok(bytes) => bytes,
                Err(WireError::Eof) => break,
                Err(e) => return Err(e.into()),
            };
            let id = Oid::from_bytes(&id)
                .map_err(|_| ObjdError::malformed("commit id of wrong length"))?;
            let title = lossy(cut_short(self.reader.read_data().await)?);
            let author_name = lossy(cut_short(self.reader.read_data().await)?);
            let author_email = lossy(cut_short(self.reader.read_data().await)?);
            let date = lossy(cut_short(self.reader.read_data().await)?);
            commits.push(CommitSummary {
                id,
                title,
                author_name,
                author_email,
                date,
            });
        }

        Ok(RepoIndex { readme, commits })
    }

    /// Opcode 2: look up a path, returning a tree listing or blob bytes.
    pub async fn tree_raw(&mut self, repo: &Path, path_spec: &str) -> ObjdResult<PathContent> {
        self.send_header(repo, OP_TREE_RAW).await?;
        self.writer.write_data(path_spec.as_bytes()).await?;
        self.read_status().await?;

        let kind = cut_short(self.reader.read_uint().await)?;
        match kind {
            1 => {
                let count = cut_short(self.reader.read_uint().await)?;
                let mut entries = Vec::with_capacity(count.min(4096) as usize);
                for _ in 0..count {
                    let type_code = cut_short(self.reader.read_uint().await)?;
                    let mode = cut_short(self.reader.read_uint().await)?;
                    let size = cut_short(self.reader.read_uint().await)?;
                    let name = utf8(cut_short(self.reader.read_data().await)?, "entry name")?;
                    let kind = match type_code {
                        1 => EntryKind::Dir,
                        2 => EntryKind::File,
                        other => {
                            return Err(ObjdError::malformed(format!(
                                "unknown entry type {other}"
                            )))
                        }
                    };
                    entries.push(PathEntry {
                        kind,
                        mode,
                        size,
                        name,
                    });
                }
                Ok(PathContent::Tree(entries))
            }
            2 => {
                // An empty blob may arrive as a bare end-of-stream.
                let content = match self.reader.read_data().await {
                    Ok(bytes) => bytes,
                    Err(WireError::Eof) => Vec::new(),
                    Err(e) => return Err(e.into()),
                };
                Ok(PathContent::Blob(content))
            }
            other => Err(ObjdError::malformed(format!("unknown object kind {other}"))),
        }
    }

    /// Opcode 3: resolve a ref to an object id.
    pub async fn resolve_ref(
        &mut self,
        repo: &Path,
        ref_type: &str,
        ref_name: &str,
    ) -> ObjdResult<Oid> {
        self.send_header(repo, OP_RESOLVE_REF).await?;
        self.writer.write_data(ref_type.as_bytes()).await?;
        self.writer.write_data(ref_name.as_bytes()).await?;
        self.read_status().await?;
        self.read_oid().await
    }

    /// Opcode 4: list branch names.
    pub async fn list_branches(&mut self, repo: &Path) -> ObjdResult<Vec<String>> {
        self.send_header(repo, OP_LIST_BRANCHES).await?;
        self.read_status().await?;
        let count = cut_short(self.reader.read_uint().await)?;
        let mut branches = Vec::with_capacity(count.min(4096) as usize);
        for _ in 0..count {
            let name = utf8(cut_short(self.reader.read_data().await)?, "branch name")?;
            branches.push(name);
        }
        Ok(branches)
    }

    /// Opcode 5: format one commit as a patch.
    pub async fn format_patch(&mut self, repo: &Path, commit: &Oid) -> ObjdResult<String> {
        self.send_header(repo, OP_FORMAT_PATCH).await?;
        self.writer.write_data(commit.to_hex().as_bytes()).await?;
        self.read_status().await?;
        Ok(lossy(cut_short(self.reader.read_data().await)?))
    }

    /// Opcode 6: full commit metadata with file diffs.
    pub async fn commit_info(&mut self, repo: &Path, commit: &Oid) -> ObjdResult<CommitDetail> {
        self.send_header(repo, OP_COMMIT_INFO).await?;
        self.writer.write_data(commit.to_hex().as_bytes()).await?;
        self.read_status().await?;

        let id = self.read_oid().await?;
        let author = self.read_signature().await?;
        let committer = self.read_signature().await?;
        let message = lossy(cut_short(self.reader.read_data().await)?);

        let parent_count = cut_short(self.reader.read_uint().await)?;
        let mut parents = Vec::with_capacity(parent_count.min(64) as usize);
        for _ in 0..parent_count {
            parents.push(self.read_oid().await?);
        }

        let file_count = cut_short(self.reader.read_uint().await)?;
        let mut files = Vec::with_capacity(file_count.min(4096) as usize);
        for _ in 0..file_count {
            let from_mode = cut_short(self.reader.read_uint().await)?;
            let to_mode = cut_short(self.reader.read_uint().await)?;
            let from_path = lossy(cut_short(self.reader.read_data().await)?);
            let to_path = lossy(cut_short(self.reader.read_data().await)?);
            let chunk_count = cut_short(self.reader.read_uint().await)?;
            let mut chunks = Vec::with_capacity(chunk_count.min(4096) as usize);
            for _ in 0..chunk_count {
                let op = cut_short(self.reader.read_uint().await)?;
                let content = lossy(cut_short(self.reader.read_data().await)?);
                chunks.push(DiffChunk { op, content });
            }
            files.push(FileDiff {
                from_mode,
                to_mode,
                from_path,
                to_path,
                chunks,
            });
        }

        Ok(CommitDetail {
            id,
            author,
            committer,
            message,
            parents,
            files,
        })
    }

    async fn read_signature(&mut self) -> ObjdResult<Signature> {
        let name = lossy(cut_short(self.reader.read_data().await)?);
        let email = lossy(cut_short(self.reader.read_data().await)?);
        let when = cut_short(self.reader.read_int().await)?;
        let tz_offset_min = cut_short(self.reader.read_int().await)?;
        Ok(Signature {
            name,
            email,
            when,
            tz_offset_min,
        })
    }

    /// Opcode 7: merge base of two commits.
    ///
    /// A pair of commits with no common ancestor is reported as
    /// [`StatusError::NoMergeBase`], a recoverable status.
    pub async fn merge_base(&mut self, repo: &Path, a: &Oid, b: &Oid) -> ObjdResult<Oid> {
        self.send_header(repo, OP_MERGE_BASE).await?;
        self.writer.write_data(a.to_hex().as_bytes()).await?;
        self.writer.write_data(b.to_hex().as_bytes()).await?;
        self.read_status().await?;
        self.read_oid().await
    }

    /// Opcode 8: commit log from a ref, newest first.
    ///
    /// `limit` of zero means unbounded. The response is terminated by
    /// end-of-stream, so this call consumes the client.
    pub async fn log(
        mut self,
        repo: &Path,
        ref_spec: &str,
        limit: u64,
    ) -> ObjdResult<Vec<CommitSummary>> {
        self.send_header(repo, OP_LOG).await?;
        self.writer.write_data(ref_spec.as_bytes()).await?;
        self.writer.write_uint(limit).await?;
        self.read_status().await?;

        let mut commits = Vec::new();
        loop {
            let id = match self.reader.read_data().await {
                Ok(bytes) => bytes,
                Err(WireError::Eof) => break,
                Err(e) => return Err(e.into()),
            };
            let id = Oid::from_bytes(&id)
                .map_err(|_| ObjdError::malformed("commit id of wrong length"))?;
            let title = lossy(cut_short(self.reader.read_data().await)?);
            let author_name = lossy(cut_short(self.reader.read_data().await)?);
            let author_email = lossy(cut_short(self.reader.read_data().await)?);
            let date = lossy(cut_short(self.reader.read_data().await)?);
            commits.push(CommitSummary {
                id,
                title,
                author_name,
                author_email,
                date,
            });
        }
        Ok(commits)
    }

    /// Opcode 9: list the raw entries of a tree object.
    pub async fn tree_list(&mut self, repo: &Path, tree: &Oid) -> ObjdResult<Vec<RawTreeEntry>> {
        self.send_header(repo, OP_TREE_LIST).await?;
        self.writer.write_data(tree.to_hex().as_bytes()).await?;
        self.read_status().await?;
        let count = cut_short(self.reader.read_uint().await)?;
        let mut entries = Vec::with_capacity(count.min(4096) as usize);
        for _ in 0..count {
            let mode = cut_short(self.reader.read_uint().await)?;
            let name = utf8(cut_short(self.reader.read_data().await)?, "tree entry name")?;
            let oid = self.read_oid().await?;
            entries.push(RawTreeEntry { mode, name, oid });
        }
        Ok(entries)
    }

    /// Opcode 10: write a tree from an explicit entry list.
    ///
    /// Entry oids travel as 20-byte fixed values; the daemon expects the
    /// entries already in canonical order.
    pub async fn write_tree(&mut self, repo: &Path, entries: &[RawTreeEntry]) -> ObjdResult<Oid> {
        self.send_header(repo, OP_WRITE_TREE).await?;
        self.writer.write_uint(entries.len() as u64).await?;
        for entry in entries {
            self.writer.write_uint(entry.mode).await?;
            self.writer.write_data(entry.name.as_bytes()).await?;
            self.writer.write_fixed(entry.oid.as_bytes()).await?;
        }
        self.read_status().await?;
        self.read_oid().await
    }

    /// Opcode 11: write a blob from raw bytes.
    pub async fn write_blob(&mut self, repo: &Path, content: &[u8]) -> ObjdResult<Oid> {
        self.send_header(repo, OP_WRITE_BLOB).await?;
        self.writer.write_data(content).await?;
        self.read_status().await?;
        self.read_oid().await
    }

    /// Opcode 12: the tree id of a commit.
    pub async fn commit_tree_oid(&mut self, repo: &Path, commit: &Oid) -> ObjdResult<Oid> {
        self.send_header(repo, OP_COMMIT_TREE).await?;
        self.writer.write_data(commit.to_hex().as_bytes()).await?;
        self.read_status().await?;
        self.read_oid().await
    }

    /// Opcode 13: create a commit.
    ///
    /// `when` is signed unix seconds, `tz_offset_min` the timezone offset
    /// in minutes, matching what [`Signature`] carries.
    #[allow(clippy::too_many_arguments)]
    pub async fn commit_create(
        &mut self,
        repo: &Path,
        tree: &Oid,
        parents: &[Oid],
        author_name: &str,
        author_email: &str,
        when: i64,
        tz_offset_min: i64,
        message: &str,
    ) -> ObjdResult<Oid> {
        self.send_header(repo, OP_COMMIT_CREATE).await?;
        self.writer.write_data(tree.to_hex().as_bytes()).await?;
        self.writer.write_uint(parents.len() as u64).await?;
        for parent in parents {
            self.writer.write_data(parent.to_hex().as_bytes()).await?;
        }
        self.writer.write_data(author_name.as_bytes()).await?;
        self.writer.write_data(author_email.as_bytes()).await?;
        self.writer.write_int(when).await?;
        self.writer.write_int(tz_offset_min).await?;
        self.writer.write_data(message.as_bytes()).await?;
        self.read_status().await?;
        self.read_oid().await
    }

    /// Opcode 14: point a ref at a commit.
    pub async fn update_ref(&mut self, repo: &Path, ref_name: &str, commit: &Oid) -> ObjdResult<()> {
        self.send_header(repo, OP_UPDATE_REF).await?;
        self.writer.write_data(ref_name.as_bytes()).await?;
        self.writer.write_data(commit.to_hex().as_bytes()).await?;
        self.read_status().await
    }

    /// Opcode 15: initialize a new bare repository with its hooks directory
    /// pointed at `hooks_path`.
    pub async fn init_repo(&mut self, repo: &Path, hooks_path: &Path) -> ObjdResult<()> {
        self.send_header(repo, OP_INIT_REPO).await?;
        self.writer
            .write_data(hooks_path.as_os_str().as_bytes())
            .await?;
        self.read_status().await
    }
}

#[cfg(test)]
mod tests {
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::UnixListener;
    use tokio::task::JoinHandle;

    use super::*;

    /// Accepts one connection, writes the canned response immediately, then
    /// collects the client's request bytes until the client closes.
    ///
    /// Writing before reading is deliberate: the client flushes its whole
    /// request before reading the status, so neither side blocks on the
    /// other.
    fn spawn_server(listener: UnixListener, response: Vec<u8>) -> JoinHandle<Vec<u8>> {
        tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            stream.write_all(&response).await.unwrap();
            stream.shutdown().await.unwrap();
            let mut request = Vec::new();
            stream.read_to_end(&mut request).await.unwrap();
            request
        })
    }

    fn encode_response(build: impl FnOnce(&mut Vec<u8>)) -> Vec<u8> {
        let mut out = Vec::new();
        build(&mut out);
        out
    }

    fn push_uint(out: &mut Vec<u8>, mut value: u64) {
        while value >= 0x80 {
            out.push((value as u8) | 0x80);
            value >>= 7;
        }
        out.push(value as u8);
    }

    fn push_data(out: &mut Vec<u8>, data: &[u8]) {
        push_uint(out, data.len() as u64);
        out.extend_from_slice(data);
    }

    fn test_oid(fill: u8) -> Oid {
        Oid::from_bytes(&[fill; 20]).unwrap()
    }

    #[tokio::test]
    async fn resolve_ref_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let socket = dir.path().join("objd.sock");
        let listener = UnixListener::bind(&socket).unwrap();

        let oid = test_oid(0xaa);
        let response = encode_response(|out| {
            push_uint(out, 0);
            push_data(out, oid.as_bytes());
        });
        let server = spawn_server(listener, response);

        let mut client = Client::connect(&socket).await.unwrap();
        let got = client
            .resolve_ref(Path::new("/repos/demo.git"), "branch", "main")
            .await
            .unwrap();
        assert_eq!(got, oid);
        drop(client);
        server.await.unwrap();
    }

    #[tokio::test]
    async fn nonzero_status_maps_to_typed_error() {
        let dir = tempfile::tempdir().unwrap();
        let socket = dir.path().join("objd.sock");
        let listener = UnixListener::bind(&socket).unwrap();

        let server = spawn_server(listener, encode_response(|out| push_uint(out, 12)));

        let mut client = Client::connect(&socket).await.unwrap();
        let err = client
            .resolve_ref(Path::new("/repos/demo.git"), "branch", "gone")
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            ObjdError::Status(StatusError::RefResolveFailed)
        ));
        drop(client);
        server.await.unwrap();
    }

    #[tokio::test]
    async fn log_reads_until_end_of_stream() {
        let dir = tempfile::tempdir().unwrap();
        let socket = dir.path().join("objd.sock");
        let listener = UnixListener::bind(&socket).unwrap();

        let first = test_oid(1);
        let second = test_oid(2);
        let response = encode_response(|out| {
            push_uint(out, 0);
            for (oid, title) in [(first, "first"), (second, "second")] {
                push_data(out, oid.as_bytes());
                push_data(out, title.as_bytes());
                push_data(out, b"A U Thor");
                push_data(out, b"author@example.org");
                push_data(out, b"2025-01-01");
            }
        });
        let server = spawn_server(listener, response);

        let client = Client::connect(&socket).await.unwrap();
        let commits = client
            .log(Path::new("/repos/demo.git"), "main", 0)
            .await
            .unwrap();
        assert_eq!(commits.len(), 2);
        assert_eq!(commits[0].id, first);
        assert_eq!(commits[0].title, "first");
        assert_eq!(commits[1].id, second);
        server.await.unwrap();
    }

    #[tokio::test]
    async fn truncated_record_is_a_protocol_error() {
        let dir = tempfile::tempdir().unwrap();
        let socket = dir.path().join("objd.sock");
        let listener = UnixListener::bind(&socket).unwrap();

        // A commit id with no following fields: the record is cut short.
        let response = encode_response(|out| {
            push_uint(out, 0);
            push_data(out, test_oid(3).as_bytes());
        });
        let server = spawn_server(listener, response);

        let client = Client::connect(&socket).await.unwrap();
        let err = client
            .log(Path::new("/repos/demo.git"), "main", 0)
            .await
            .unwrap_err();
        assert!(matches!(err, ObjdError::MalformedResponse { .. }));
        server.await.unwrap();
    }

    #[tokio::test]
    async fn index_without_readme_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        let socket = dir.path().join("objd.sock");
        let listener = UnixListener::bind(&socket).unwrap();

        // Status only; the daemon closes without a readme or commits.
        let server = spawn_server(listener, encode_response(|out| push_uint(out, 0)));

        let client = Client::connect(&socket).await.unwrap();
        let index = client.index(Path::new("/repos/empty.git")).await.unwrap();
        assert!(index.readme.is_none());
        assert!(index.commits.is_empty());
        server.await.unwrap();
    }

    #[tokio::test]
    async fn tree_raw_distinguishes_tree_and_blob() {
        let dir = tempfile::tempdir().unwrap();
        let socket = dir.path().join("objd.sock");
        let listener = UnixListener::bind(&socket).unwrap();

        let response = encode_response(|out| {
            push_uint(out, 0);
            push_uint(out, 2); // blob
            push_data(out, b"hello\n");
        });
        let server = spawn_server(listener, response);

        let mut client = Client::connect(&socket).await.unwrap();
        let content = client
            .tree_raw(Path::new("/repos/demo.git"), "README.md")
            .await
            .unwrap();
        match content {
            PathContent::Blob(bytes) => assert_eq!(bytes, b"hello\n"),
            PathContent::Tree(_) => panic!("expected blob"),
        }
        drop(client);
        server.await.unwrap();
    }

    #[tokio::test]
    async fn write_tree_sends_fixed_oids() {
        let dir = tempfile::tempdir().unwrap();
        let socket = dir.path().join("objd.sock");
        let listener = UnixListener::bind(&socket).unwrap();

        let new_tree = test_oid(9);
        let response = encode_response(|out| {
            push_uint(out, 0);
            push_data(out, new_tree.as_bytes());
        });
        let server = spawn_server(listener, response);

        let mut client = Client::connect(&socket).await.unwrap();
        let entries = vec![RawTreeEntry {
            mode: crate::objd::MODE_FILE,
            name: "a.txt".to_owned(),
            oid: test_oid(7),
        }];
        let got = client
            .write_tree(Path::new("/repos/demo.git"), &entries)
            .await
            .unwrap();
        assert_eq!(got, new_tree);
        drop(client);

        // The request ends with the entry oid as 20 raw bytes, no length
        // prefix.
        let request = server.await.unwrap();
        assert_eq!(&request[request.len() - 20..], test_oid(7).as_bytes());
    }
}
