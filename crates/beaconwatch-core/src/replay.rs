//! JSON-lines detection feed: a [`ScanningCapability`] that reads detections
//! from a file or from stdin.
//!
//! Each line is one [`ReplayRecord`]:
//!
//! ```json
//! {"address": "c3:11:4a:02:9e:10", "rssi": -71, "frame": "00e7edd1ebeac04e5defa0170000000000a10000"}
//! {"address": "c3:11:4a:02:9e:11", "rssi": -64, "namespace": "0xedd1ebeac04e5defa017", "instance": "0xa2", "at_ms": 1500}
//! ```
//!
//! `frame` is raw Eddystone service data; without it `namespace`/`instance`
//! are taken as given. `at_ms` delays delivery until that many milliseconds
//! after the pass started (file sources only). Blank lines and lines starting
//! with `#` are skipped; malformed lines are logged and skipped.

use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::{Path, PathBuf};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError};
use std::sync::{Arc, Mutex, OnceLock, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use log::{debug, info, trace, warn};
use serde::Deserialize;

use crate::eddystone::{NamespaceFilter, UidFrame};
use crate::error::{DecodeError, ScanError};
use crate::mapping::normalize_id;
use crate::scanner::{BeaconMetadata, Detection, DetectionSink, ScanningCapability, deliver};
use crate::signal::StopSignal;

/// How often a stdin worker re-checks its stop signal while idle.
const POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Pause between passes over a repeating file that carries no `at_ms`.
const REPEAT_IDLE: Duration = Duration::from_millis(100);

/// One line of the feed.
#[derive(Debug, Clone, Deserialize)]
pub struct ReplayRecord {
    #[serde(default)]
    pub address: String,
    pub rssi: i16,
    #[serde(default)]
    pub frame: Option<String>,
    #[serde(default)]
    pub namespace: Option<String>,
    #[serde(default)]
    pub instance: Option<String>,
    #[serde(default)]
    pub at_ms: Option<u64>,
}

impl ReplayRecord {
    pub fn into_detection(self) -> Result<Detection, DecodeError> {
        let metadata = match (&self.frame, &self.instance) {
            (Some(frame), _) => {
                let uid = UidFrame::decode_hex(frame)?;
                BeaconMetadata {
                    namespace: uid.namespace_id(),
                    instance: uid.instance_id(),
                }
            }
            (None, Some(instance)) => BeaconMetadata {
                namespace: self
                    .namespace
                    .as_deref()
                    .and_then(|ns| normalize_id(ns).ok())
                    .unwrap_or_default(),
                instance: instance.clone(),
            },
            (None, None) => return Err(DecodeError::MissingIdentity),
        };
        Ok(Detection {
            address: self.address,
            rssi: self.rssi,
            metadata,
        })
    }
}

/// Where the feed comes from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReplaySource {
    File(PathBuf),
    Stdin,
}

impl ReplaySource {
    /// `-` means stdin, anything else is a file path.
    pub fn parse(arg: &str) -> Self {
        if arg == "-" {
            Self::Stdin
        } else {
            Self::File(PathBuf::from(arg))
        }
    }
}

struct Worker {
    stop: StopSignal,
    handle: JoinHandle<()>,
}

/// Scanner that replays a JSON-lines feed into the sink.
pub struct ReplayScanner {
    source: ReplaySource,
    repeat: bool,
    worker: Option<Worker>,
}

impl ReplayScanner {
    pub fn new(source: ReplaySource) -> Self {
        Self {
            source,
            repeat: false,
            worker: None,
        }
    }

    /// Loop a file source forever instead of stopping at EOF.
    pub fn repeat(mut self, repeat: bool) -> Self {
        self.repeat = repeat;
        self
    }

    pub fn source(&self) -> &ReplaySource {
        &self.source
    }
}

impl ScanningCapability for ReplayScanner {
    fn start(
        &mut self,
        filter: NamespaceFilter,
        sink: Arc<dyn DetectionSink>,
    ) -> Result<(), ScanError> {
        if self.is_running() {
            return Err(ScanError::AlreadyRunning);
        }
        // Reap a worker that already finished on its own (EOF).
        if let Some(old) = self.worker.take() {
            let _ = old.handle.join();
        }

        let stop = StopSignal::new();
        let feed = Feed {
            filter,
            sink,
            stop: stop.clone(),
        };
        let handle = match &self.source {
            ReplaySource::File(path) => {
                let file = open(path)?;
                let path = path.clone();
                let repeat = self.repeat;
                thread::Builder::new()
                    .name("replay-file".to_string())
                    .spawn(move || feed.run_file(file, &path, repeat))
            }
            ReplaySource::Stdin => thread::Builder::new()
                .name("replay-stdin".to_string())
                .spawn(move || feed.run_stdin(stdin_lines())),
        }
        .map_err(ScanError::Spawn)?;

        info!("detection feed started from {:?}", self.source);
        self.worker = Some(Worker { stop, handle });
        Ok(())
    }

    fn stop(&mut self) {
        if let Some(worker) = self.worker.take() {
            worker.stop.stop();
            if worker.handle.join().is_err() {
                warn!("detection feed worker panicked");
            }
            info!("detection feed stopped");
        }
    }

    fn is_running(&self) -> bool {
        self.worker
            .as_ref()
            .is_some_and(|w| !w.handle.is_finished())
    }
}

impl Drop for ReplayScanner {
    fn drop(&mut self) {
        self.stop();
    }
}

fn open(path: &Path) -> Result<File, ScanError> {
    File::open(path).map_err(|source| ScanError::Open {
        path: path.to_path_buf(),
        source,
    })
}

/// Lines of stdin, read by one process-wide thread so successive scanner
/// runs never compete for the handle.
fn stdin_lines() -> &'static Mutex<Receiver<String>> {
    static LINES: OnceLock<Mutex<Receiver<String>>> = OnceLock::new();
    LINES.get_or_init(|| {
        let (tx, rx) = mpsc::channel();
        let spawned = thread::Builder::new()
            .name("stdin-reader".to_string())
            .spawn(move || {
                for line in std::io::stdin().lock().lines() {
                    match line {
                        Ok(line) => {
                            if tx.send(line).is_err() {
                                break;
                            }
                        }
                        Err(e) => {
                            warn!("stdin read error: {e}");
                            break;
                        }
                    }
                }
            });
        if let Err(e) = spawned {
            warn!("cannot spawn stdin reader: {e}");
        }
        Mutex::new(rx)
    })
}

struct Feed {
    filter: NamespaceFilter,
    sink: Arc<dyn DetectionSink>,
    stop: StopSignal,
}

impl Feed {
    fn run_file(&self, file: File, path: &Path, repeat: bool) {
        let mut file = file;
        loop {
            let started = Instant::now();
            let mut paced = false;
            for line in BufReader::new(file).lines() {
                if self.stop.is_stopped() {
                    return;
                }
                let line = match line {
                    Ok(line) => line,
                    Err(e) => {
                        warn!("read error in {}: {e}", path.display());
                        break;
                    }
                };
                let Some(record) = parse_line(&line) else {
                    continue;
                };
                if let Some(at) = record.at_ms {
                    paced = true;
                    let due = started + Duration::from_millis(at);
                    if self
                        .stop
                        .wait_timeout(due.saturating_duration_since(Instant::now()))
                    {
                        return;
                    }
                }
                self.dispatch(record);
            }

            if !repeat || self.stop.is_stopped() {
                break;
            }
            if !paced && self.stop.wait_timeout(REPEAT_IDLE) {
                break;
            }
            file = match File::open(path) {
                Ok(f) => f,
                Err(e) => {
                    warn!("cannot reopen {}: {e}", path.display());
                    break;
                }
            };
        }
        debug!("detection feed {} exhausted", path.display());
    }

    fn run_stdin(&self, lines: &Mutex<Receiver<String>>) {
        let rx = lines.lock().unwrap_or_else(PoisonError::into_inner);
        while !self.stop.is_stopped() {
            match rx.recv_timeout(POLL_INTERVAL) {
                Ok(line) => {
                    if let Some(record) = parse_line(&line) {
                        self.dispatch(record);
                    }
                }
                Err(RecvTimeoutError::Timeout) => {}
                Err(RecvTimeoutError::Disconnected) => {
                    info!("detection stream on stdin closed");
                    break;
                }
            }
        }
    }

    fn dispatch(&self, record: ReplayRecord) {
        let detection = match record.into_detection() {
            Ok(d) => d,
            Err(e) => {
                debug!("skipping undecodable detection: {e}");
                return;
            }
        };
        if !self.filter.matches(&detection.metadata.namespace) {
            trace!(
                "namespace {} filtered out ({})",
                detection.metadata.namespace, detection.address
            );
            return;
        }
        if self.stop.is_stopped() {
            return;
        }
        deliver(self.sink.as_ref(), &detection);
    }
}

fn parse_line(line: &str) -> Option<ReplayRecord> {
    let trimmed = line.trim();
    if trimmed.is_empty() || trimmed.starts_with('#') {
        return None;
    }
    match serde_json::from_str(trimmed) {
        Ok(record) => Some(record),
        Err(e) => {
            debug!("skipping malformed detection line: {e}");
            None
        }
    }
}
