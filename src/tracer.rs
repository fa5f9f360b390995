use crate::config::Config;
use crate::detector::AnomalyDetector;
use crate::models::{Category, SyscallEvent};
use crate::queue::EventQueue;
use crate::syscalls::{CategoryClassifier, SignatureTable, SyscallTable};
use anyhow::{Context, Result};
use aya::Ebpf;
use aya::maps::perf::AsyncPerfEventArray;
use aya::programs::TracePoint;
use aya::util::online_cpus;
use bytes::BytesMut;
use nix::libc;
use std::collections::HashMap;
use std::fs;
use std::mem;
use std::os::unix::fs::MetadataExt;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Instant;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{Duration, interval};
use tracing::{debug, error, info};

/// Hard delivery limiter: at most one accepted raw event per 10 ms,
/// independent of the detector's own statistics.
pub const MIN_EMIT_INTERVAL: Duration = Duration::from_millis(10);

/// Cadence of the decoupled batch-analysis task. Independent of the
/// frequency detector's own once-per-second evaluation gate.
pub const BATCH_INTERVAL: Duration = Duration::from_millis(250);

const DEFAULT_EBPF_OBJECT_PATH: &str = "/usr/lib/vitals/vitals-ebpf.o";
const TRACEPOINT_PROGRAM: &str = "vitals_sys_enter";
const RAW_CHANNEL_DEPTH: usize = 512;

/// Wire format of one kernel event, mirroring the eBPF program's struct.
#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct RawSyscall {
    pub pid: u32,
    pub id: u64,
    pub args: [u64; 6],
}

pub fn decode_raw_event(buf: &[u8]) -> Option<RawSyscall> {
    if buf.len() < mem::size_of::<RawSyscall>() {
        return None;
    }
    // SAFETY: length is validated above and perf buffers carry no alignment
    // guarantee for RawSyscall, so an unaligned read is required.
    Some(unsafe { std::ptr::read_unaligned(buf.as_ptr() as *const RawSyscall) })
}

/// Advisory per-category display toggles. These gate what reaches the output
/// queue, never what reaches the detector, so hiding a category cannot
/// degrade detection quality.
pub struct CategoryFilters {
    visible: Mutex<HashMap<Category, bool>>,
}

impl CategoryFilters {
    pub fn from_config(cfg: &Config) -> Self {
        let visible = cfg
            .default_visibility()
            .into_iter()
            .map(|(name, visible)| (Category::new(name), visible))
            .collect();
        Self {
            visible: Mutex::new(visible),
        }
    }

    pub fn set(&self, category: &Category, enabled: bool) {
        let mut visible = self.visible.lock().unwrap_or_else(|e| e.into_inner());
        visible.insert(category.clone(), enabled);
    }

    pub fn is_visible(&self, category: &Category) -> bool {
        let visible = self.visible.lock().unwrap_or_else(|e| e.into_inner());
        visible.get(category).copied().unwrap_or(true)
    }
}

/// The single-context decode path: rate limiting, pid filtering, name and
/// category resolution, argument zipping, ingestion, and queue publication.
struct EventPipeline {
    pid: i32,
    syscalls: Arc<SyscallTable>,
    classifier: Arc<CategoryClassifier>,
    signatures: Arc<SignatureTable>,
    detector: Arc<Mutex<AnomalyDetector>>,
    queue: Arc<EventQueue>,
    filters: Arc<CategoryFilters>,
    last_emit: Option<Instant>,
}

impl EventPipeline {
    fn handle_raw(&mut self, raw: &RawSyscall, now: Instant) {
        // Storm protection comes first; the limiter counts accepted events
        // regardless of which pid they belong to.
        if let Some(last) = self.last_emit
            && now.saturating_duration_since(last) < MIN_EMIT_INTERVAL
        {
            return;
        }
        self.last_emit = Some(now);

        let pid = raw.pid as i32;
        if pid != self.pid {
            return;
        }

        let name = self.syscalls.name_for(raw.id);
        let category = self.classifier.classify(&name);
        let args = self.signatures.zip_args(&name, &raw.args);

        let mut event = SyscallEvent::new(pid, name, category.clone());
        event.args = args.clone();

        {
            let mut detector = self.detector.lock().unwrap_or_else(|e| e.into_inner());
            detector.ingest(pid, event.name.clone(), category.clone(), args);
            event.anomalies = detector.take_findings_for(pid);
        }

        if !self.filters.is_visible(&category) {
            return;
        }
        let _ = self.queue.push(event);
    }
}

/// Attaches the eBPF tracepoint for one pid and runs the capture pipeline.
///
/// Three task groups: per-cpu perf readers funneling raw events into a
/// single delivery task (which owns all pipeline state), and a batch-analysis
/// task on its own timer so a slow statistics pass can never stall delivery.
pub struct Tracer {
    pid: i32,
    ebpf_object: Option<PathBuf>,
    syscalls: Arc<SyscallTable>,
    classifier: Arc<CategoryClassifier>,
    signatures: Arc<SignatureTable>,
    detector: Arc<Mutex<AnomalyDetector>>,
    queue: Arc<EventQueue>,
    filters: Arc<CategoryFilters>,
    running: Arc<AtomicBool>,
    handles: Vec<JoinHandle<()>>,
}

impl Tracer {
    pub fn new(
        pid: i32,
        cfg: &Config,
        syscalls: Arc<SyscallTable>,
        classifier: Arc<CategoryClassifier>,
        signatures: Arc<SignatureTable>,
    ) -> Self {
        let detector = Arc::new(Mutex::new({
            let mut detector = AnomalyDetector::new();
            detector.set_sensitivity(cfg.sensitivity);
            detector
        }));
        Self {
            pid,
            ebpf_object: cfg
                .ebpf_object
                .as_deref()
                .map(PathBuf::from)
                .or_else(debug_ebpf_override_path),
            syscalls,
            classifier,
            signatures,
            detector,
            queue: Arc::new(EventQueue::new()),
            filters: Arc::new(CategoryFilters::from_config(cfg)),
            running: Arc::new(AtomicBool::new(false)),
            handles: Vec::new(),
        }
    }

    pub fn events(&self) -> Arc<EventQueue> {
        Arc::clone(&self.queue)
    }

    pub fn detector(&self) -> Arc<Mutex<AnomalyDetector>> {
        Arc::clone(&self.detector)
    }

    pub fn set_filter(&self, category: &Category, enabled: bool) {
        self.filters.set(category, enabled);
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Relaxed)
    }

    pub fn start(&mut self) -> Result<()> {
        if self.running.swap(true, Ordering::SeqCst) {
            return Ok(());
        }

        let path = resolve_ebpf_object(self.ebpf_object.clone())?;
        let mut bpf = Ebpf::load_file(&path)
            .with_context(|| format!("failed loading eBPF object {}", path.display()))?;
        attach_sys_enter(&mut bpf)?;

        let events_map = bpf
            .take_map("EVENTS")
            .ok_or_else(|| anyhow::anyhow!("missing EVENTS map in eBPF object"))?;
        let mut perf_array =
            AsyncPerfEventArray::try_from(events_map).context("failed to open EVENTS perf array")?;

        let cpus = online_cpus().map_err(|(msg, err)| anyhow::anyhow!("{msg}: {err}"))?;
        let mut readers = Vec::new();
        for cpu in cpus {
            let buf = perf_array
                .open(cpu, None)
                .with_context(|| format!("open perf buffer for cpu {cpu}"))?;
            readers.push((cpu, buf));
        }

        let (raw_tx, mut raw_rx) = mpsc::channel::<RawSyscall>(RAW_CHANNEL_DEPTH);

        for (cpu, mut buf) in readers {
            let tx = raw_tx.clone();
            let running = Arc::clone(&self.running);
            self.handles.push(tokio::spawn(async move {
                let mut buffers = (0..16)
                    .map(|_| BytesMut::with_capacity(256))
                    .collect::<Vec<_>>();
                while running.load(Ordering::Relaxed) {
                    match buf.read_events(&mut buffers).await {
                        Ok(events) => {
                            for slot in buffers.iter().take(events.read) {
                                if let Some(raw) = decode_raw_event(slot)
                                    && tx.try_send(raw).is_err()
                                {
                                    debug!(cpu, "raw channel full, dropping kernel event");
                                }
                            }
                            for slot in buffers.iter_mut() {
                                slot.clear();
                            }
                        }
                        Err(err) => {
                            error!(?err, cpu, "error reading perf events");
                            break;
                        }
                    }
                }
            }));
        }
        drop(raw_tx);

        let mut pipeline = EventPipeline {
            pid: self.pid,
            syscalls: Arc::clone(&self.syscalls),
            classifier: Arc::clone(&self.classifier),
            signatures: Arc::clone(&self.signatures),
            detector: Arc::clone(&self.detector),
            queue: Arc::clone(&self.queue),
            filters: Arc::clone(&self.filters),
            last_emit: None,
        };
        let running = Arc::clone(&self.running);
        self.handles.push(tokio::spawn(async move {
            // The loaded program detaches when this task ends.
            let _bpf = bpf;
            while running.load(Ordering::Relaxed) {
                match raw_rx.recv().await {
                    Some(raw) => pipeline.handle_raw(&raw, Instant::now()),
                    None => break,
                }
            }
        }));

        let detector = Arc::clone(&self.detector);
        let running = Arc::clone(&self.running);
        self.handles.push(tokio::spawn(async move {
            let mut ticker = interval(BATCH_INTERVAL);
            while running.load(Ordering::Relaxed) {
                ticker.tick().await;
                let findings = {
                    let mut detector = detector.lock().unwrap_or_else(|e| e.into_inner());
                    detector.run_batch()
                };
                if !findings.is_empty() {
                    debug!(count = findings.len(), "batch pass produced findings");
                }
            }
        }));

        info!(pid = self.pid, object = %path.display(), "tracer attached");
        Ok(())
    }

    /// Cooperative shutdown: flips the running flag and aborts the tasks.
    /// No in-flight event is interrupted mid-decode.
    pub fn stop(&mut self) {
        if !self.running.swap(false, Ordering::SeqCst) {
            return;
        }
        for handle in self.handles.drain(..) {
            handle.abort();
        }
        info!(pid = self.pid, "tracer stopped");
    }
}

impl Drop for Tracer {
    fn drop(&mut self) {
        self.stop();
    }
}

fn attach_sys_enter(bpf: &mut Ebpf) -> Result<()> {
    let program = bpf
        .program_mut(TRACEPOINT_PROGRAM)
        .ok_or_else(|| anyhow::anyhow!("missing tracepoint program: {TRACEPOINT_PROGRAM}"))?;
    let program: &mut TracePoint = program
        .try_into()
        .with_context(|| format!("{TRACEPOINT_PROGRAM} is not a tracepoint program"))?;
    program
        .load()
        .with_context(|| format!("failed to load {TRACEPOINT_PROGRAM}"))?;
    program
        .attach("raw_syscalls", "sys_enter")
        .with_context(|| format!("failed to attach {TRACEPOINT_PROGRAM} to raw_syscalls/sys_enter"))?;
    Ok(())
}

fn resolve_ebpf_object(path: Option<PathBuf>) -> Result<PathBuf> {
    let path = path.unwrap_or_else(|| PathBuf::from(DEFAULT_EBPF_OBJECT_PATH));
    if !path.exists() {
        anyhow::bail!("eBPF object not found at {}", path.display());
    }
    validate_ebpf_object_file(&path)?;
    Ok(path)
}

#[cfg(debug_assertions)]
fn debug_ebpf_override_path() -> Option<PathBuf> {
    std::env::var("VITALS_EBPF_OBJECT").ok().map(PathBuf::from)
}

#[cfg(not(debug_assertions))]
fn debug_ebpf_override_path() -> Option<PathBuf> {
    None
}

fn validate_ebpf_object_file(path: &PathBuf) -> Result<()> {
    let metadata = fs::symlink_metadata(path)
        .with_context(|| format!("failed to stat eBPF object {}", path.display()))?;
    if !metadata.file_type().is_file() {
        anyhow::bail!("eBPF object must be a regular file: {}", path.display());
    }
    let uid = metadata.uid();
    // SAFETY: geteuid has no preconditions.
    let current_uid = unsafe { libc::geteuid() };
    if uid != current_uid && uid != 0 {
        anyhow::bail!(
            "eBPF object owner must be current user ({}) or root (0), got {} for {}",
            current_uid,
            uid,
            path.display()
        );
    }
    let mode = metadata.mode();
    if mode & 0o002 != 0 {
        anyhow::bail!(
            "eBPF object is world-writable and untrusted: {} (mode {:o})",
            path.display(),
            mode & 0o7777
        );
    }
    Ok(())
}
