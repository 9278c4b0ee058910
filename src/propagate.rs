use crate::prelude::*;
use crate::metadata::keys;
use crate::node::{time_to_attr, Lookup, Node};
use crate::util::with_suffix;
use chrono::{DateTime, Utc};
use std::fs::{self, File};
use std::io::BufReader;
use std::sync::mpsc;
use std::thread;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Mode {
    /// Apply the ancestor walk inline, before the originating operation
    /// returns.
    Sync,
    /// Persist a change record, then let a background worker aggregate and
    /// apply. The record is durable before the operation returns, so a crash
    /// loses nothing; the next drain replays it.
    Async,
}

impl Default for Mode {
    fn default() -> Self {
        Mode::Sync
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Options {
    pub tree_time: bool,
    pub tree_size: bool,
    #[serde(default)]
    pub mode: Mode,
}

impl Default for Options {
    fn default() -> Self {
        Options {
            tree_time: true,
            tree_size: true,
            mode: Mode::Sync,
        }
    }
}

/// A pending propagation, stored at `changes/<node-id>/<uuid>.bin` where the
/// node id names the first directory the walk updates.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Change {
    pub sync_time: DateTime<Utc>,
    pub size_delta: i64,
    pub space_root: NodeId,
}

/// Maintains `tmtime` and `tree_size` along ancestor chains.
///
/// Propagations for disjoint subtrees proceed independently; propagations
/// sharing an ancestor serialize on that ancestor's metadata lock. The walk
/// updates a directory first and only then consults its propagation flag, so
/// a node with propagation disabled still accounts for its own children but
/// stops the walk from crossing it.
pub struct Propagator {
    lookup: Lookup,
    opts: Options,
    queue: Option<mpsc::Sender<NodeId>>,
    worker: Option<thread::JoinHandle<()>>,
}

impl Propagator {
    pub fn new(lookup: Lookup, opts: Options) -> Propagator {
        let (queue, worker) = match opts.mode {
            Mode::Sync => (None, None),
            Mode::Async => {
                let (tx, rx) = mpsc::channel::<NodeId>();
                let worker_lookup = lookup.clone();
                let worker_opts = opts.clone();
                let handle = thread::Builder::new()
                    .name("decomposedfs-propagator".into())
                    .spawn(move || {
                        while let Ok(id) = rx.recv() {
                            if let Err(e) = process_pending(&worker_lookup, &worker_opts, &id)
                            {
                                error!(node = %id, "async propagation failed: {e}");
                            }
                        }
                    })
                    .expect("spawning propagation worker");
                (Some(tx), Some(handle))
            }
        };
        Propagator {
            lookup,
            opts,
            queue,
            worker,
        }
    }

    /// An async propagator without its own worker; the embedding service
    /// drives draining through `flush`/`process_pending`.
    pub fn detached(lookup: Lookup, opts: Options) -> Propagator {
        Propagator {
            lookup,
            opts,
            queue: None,
            worker: None,
        }
    }

    /// Account `size_delta` bytes to `parent` and its ancestors. `parent` is
    /// the directory that gained or lost the bytes; the walk starts there and
    /// climbs to the space root.
    pub fn propagate(&self, parent: &Node, size_delta: i64) -> Result<()> {
        match self.opts.mode {
            Mode::Sync => {
                apply_walk(&self.lookup, &self.opts, parent, Utc::now(), size_delta)
            }
            Mode::Async => {
                self.persist_change(parent, size_delta)?;
                if let Some(queue) = &self.queue {
                    // the worker exiting is not an error here; records stay
                    // durable and the next drain picks them up
                    let _ = queue.send(parent.id);
                }
                Ok(())
            }
        }
    }

    fn persist_change(&self, parent: &Node, size_delta: i64) -> Result<()> {
        let dir = self.lookup.layout.changes_dir(&parent.id);
        fs::create_dir_all(&dir)?;
        let change = Change {
            sync_time: Utc::now(),
            size_delta,
            space_root: parent.space_root,
        };
        let tmp = tempfile::NamedTempFile::new_in(self.lookup.layout.changes_root())?;
        ciborium::ser::into_writer(&change, &tmp)
            .map_err(|e| FsError::internal(format!("encoding change record: {e}")))?;
        tmp.as_file().sync_data()?;
        tmp.persist(dir.join(format!("{}.bin", Uuid::new_v4())))
            .map_err(|e| FsError::Internal(e.error))?;
        Ok(())
    }

    /// Drain pending records for one node.
    pub fn process_pending(&self, id: &NodeId) -> Result<()> {
        process_pending(&self.lookup, &self.opts, id)
    }

    /// Drain every pending record. Used by maintenance and by embedders of
    /// detached propagators.
    pub fn flush(&self) -> Result<()> {
        let root = self.lookup.layout.changes_root();
        let mut ids = HashSet::new();
        for entry in fs::read_dir(root)? {
            let entry = entry?;
            let name = entry.file_name().to_string_lossy().into_owned();
            let name = name.strip_suffix(".processing").unwrap_or(&name);
            match NodeId::try_from(name) {
                Ok(id) => {
                    ids.insert(id);
                }
                Err(_) => {
                    // stray temp file from an interrupted persist
                    debug!("skipping foreign entry {name:?} in changes dir");
                }
            }
        }
        for id in ids {
            self.process_pending(&id)?;
        }
        Ok(())
    }
}

impl Drop for Propagator {
    fn drop(&mut self) {
        // closing the channel stops the worker loop
        self.queue.take();
        if let Some(handle) = self.worker.take() {
            let _ = handle.join();
        }
    }
}

fn apply_walk(
    lookup: &Lookup,
    opts: &Options,
    start: &Node,
    sync_time: DateTime<Utc>,
    size_delta: i64,
) -> Result<()> {
    let mut cursor = Some(start.clone());
    while let Some(node) = cursor {
        apply_one(lookup, opts, &node, sync_time, size_delta)?;
        if !node.propagation_enabled()? {
            debug!(node = %node.id, "propagation stops here");
            break;
        }
        cursor = node.parent()?;
    }
    Ok(())
}

/// One ancestor update, atomic under the node's metadata lock.
fn apply_one(
    lookup: &Lookup,
    opts: &Options,
    node: &Node,
    sync_time: DateTime<Utc>,
    size_delta: i64,
) -> Result<()> {
    let dir = node.dir();
    lookup.meta.update(&dir, &mut |map| {
        if opts.tree_time {
            let current = map
                .get(keys::TMTIME)
                .and_then(|v| std::str::from_utf8(v).ok())
                .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
                .map(|t| t.with_timezone(&Utc));
            // absent, malformed, or older: overwrite
            if current.map_or(true, |t| t < sync_time) {
                map.insert(keys::TMTIME.to_owned(), time_to_attr(&sync_time));
            }
            map.remove(keys::TMP_ETAG);
        }
        if opts.tree_size && size_delta != 0 {
            let current = map
                .get(keys::TREE_SIZE)
                .and_then(|v| std::str::from_utf8(v).ok())
                .and_then(|s| s.parse::<u64>().ok());
            let new_size = match current {
                Some(size) => {
                    if size_delta >= 0 {
                        size.saturating_add(size_delta as u64)
                    } else {
                        let shrink = size_delta.unsigned_abs();
                        if shrink > size {
                            error!(
                                node = %node.id,
                                "tree size underflow ({size} - {shrink}), storing zero"
                            );
                            0
                        } else {
                            size - shrink
                        }
                    }
                }
                None => compute_tree_size(lookup, node)?,
            };
            map.insert(keys::TREE_SIZE.to_owned(), new_size.to_string().into_bytes());
        }
        Ok(())
    })
}

/// Full recomputation fallback: sum child blob sizes and child tree sizes.
fn compute_tree_size(lookup: &Lookup, node: &Node) -> Result<u64> {
    let mut total = 0u64;
    for entry in fs::read_dir(node.dir())? {
        let entry = entry?;
        let target = match fs::read_link(entry.path()) {
            Ok(t) => t,
            Err(_) => continue,
        };
        let id = match lookup.layout.parse_child_link(&target) {
            Ok(id) => id,
            Err(_) => continue,
        };
        let child = Node::read_by_id(lookup, node.space_root, id)?;
        if !child.exists {
            continue;
        }
        total += if child.blob_id.is_some() {
            child.blob_size
        } else {
            child.tree_size()?.unwrap_or(0)
        };
    }
    Ok(total)
}

/// Aggregate and apply the pending records of one node. The rename to
/// `.processing` is the single-writer guard: whoever renames wins, everyone
/// else finds nothing to do. A `.processing` directory left by a crash is
/// adopted as-is.
pub fn process_pending(lookup: &Lookup, opts: &Options, id: &NodeId) -> Result<()> {
    let dir = lookup.layout.changes_dir(id);
    let processing = with_suffix(&dir, ".processing");
    if !processing.exists() {
        match fs::rename(&dir, &processing) {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(()),
            Err(e) => return Err(FsError::Internal(e)),
        }
    }

    let mut sync_time: Option<DateTime<Utc>> = None;
    let mut size_delta = 0i64;
    let mut space_root: Option<NodeId> = None;
    for entry in fs::read_dir(&processing)? {
        let entry = entry?;
        let file = File::open(entry.path())?;
        let change: Change =
            ciborium::de::from_reader(BufReader::new(file)).map_err(|e| {
                FsError::internal(format!(
                    "corrupt change record {}: {e}",
                    entry.path().display()
                ))
            })?;
        sync_time = Some(sync_time.map_or(change.sync_time, |t| t.max(change.sync_time)));
        size_delta += change.size_delta;
        space_root = Some(change.space_root);
    }

    if let (Some(t), Some(root)) = (sync_time, space_root) {
        match Node::read_by_id(lookup, root, *id) {
            Ok(node) if node.exists => apply_walk(lookup, opts, &node, t, size_delta)?,
            Ok(_) | Err(FsError::NotFound(_)) => {
                warn!(node = %id, "dropping pending propagation for vanished node");
            }
            Err(e) => return Err(e),
        }
    }
    fs::remove_dir_all(&processing)?;
    Ok(())
}
