//! Per-PCM multi-client dispatcher.
//!
//! One [`Multi`] sits between a transport PCM and its local clients. For
//! playback it owns the ring mix buffer and a `pcm-mix` worker thread that
//! feeds it from the clients' pipes; for capture it fans transport audio out
//! to every running client and a `pcm-snoop` worker watches the control
//! sockets. The worker is the only thread that mutates client state; the
//! transport thread enters through [`Multi::read`] / [`Multi::write`] and is
//! paced by a condition variable plus an eventfd hand-off.
//!
//! Lock order, outer to inner: buffer mutex, client mutex, hand-off mutex.
//! The embedding process is expected to ignore `SIGPIPE`, as anything
//! writing to client-owned pipes must.

mod client;
mod events;

use std::os::fd::{AsRawFd, OwnedFd};
use std::sync::Arc;
use std::sync::atomic::{AtomicU8, Ordering};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use parking_lot::{Condvar, Mutex};
use tracing::{debug, error, warn};

use crate::audio::constants::{MAX_CHANNELS, WAKEUP_SHUTDOWN};
use crate::audio::format::SampleFormat;
use crate::audio::mix::MixBuffer;
use crate::common::errors::MixerError;
use crate::configs::MultiConfig;
use crate::transport::{StreamDirection, TransportAudio, TransportLink, TransportSignal};

use client::{Client, ClientState};
use events::Eventfd;

/// Dispatcher lifecycle of one PCM.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum MultiState {
    /// Created or starved; waiting for the mix to pre-roll.
    Init = 0,
    Running = 1,
    Paused = 2,
    /// Terminal for this cycle; capture may reset on the next client.
    Finished = 3,
}

impl MultiState {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => MultiState::Init,
            1 => MultiState::Running,
            2 => MultiState::Paused,
            _ => MultiState::Finished,
        }
    }
}

/// Stream geometry shared by the dispatcher and its clients, fixed by
/// [`Multi::init`].
#[derive(Debug, Clone, Copy)]
pub(crate) struct Geometry {
    pub period_samples: usize,
    pub period_bytes: usize,
    pub sample_size: usize,
    pub frame_size: usize,
    /// Periods the mix pre-rolls before the transport starts reading.
    pub mix_threshold: usize,
    /// Periods a client buffers locally before it starts streaming.
    pub client_threshold: usize,
    pub drain_settle: Duration,
}

struct BufferState {
    /// Playback only; capture never allocates a mix.
    mix: Option<MixBuffer>,
    /// Set by the worker after a refill; cleared by the transport read.
    ready: bool,
}

struct ClientSet {
    clients: Vec<Client>,
    /// Clients currently counted as streaming (running, or draining for
    /// playback). Recomputed after every mutation of the set.
    active: usize,
    geometry: Option<Geometry>,
    worker: Option<JoinHandle<()>>,
}

impl ClientSet {
    fn recount(&mut self) {
        self.active = self.clients.iter().filter(|c| c.is_active()).count();
    }

    /// Remove every finished client. Returns how many were evicted.
    ///
    /// Always recounts: a dispatched control command can flip a client's
    /// active status without anyone being evicted.
    fn reap(&mut self) -> usize {
        let before = self.clients.len();
        self.clients.retain(|c| c.state() != ClientState::Finished);
        let evicted = before - self.clients.len();
        if evicted > 0 {
            debug!("evicted {} client(s), {} left", evicted, self.clients.len());
        }
        self.recount();
        evicted
    }
}

struct Shared {
    link: Arc<dyn TransportLink>,
    direction: StreamDirection,
    cfg: MultiConfig,
    audio: TransportAudio,
    state: AtomicU8,
    buffer: Mutex<BufferState>,
    cond: Condvar,
    clients: Mutex<ClientSet>,
    /// Kicks the worker out of `poll`.
    wakeup: Eventfd,
    /// Transport-facing event source, created lazily with the first client.
    handoff: Mutex<Option<Eventfd>>,
}

impl Shared {
    fn state(&self) -> MultiState {
        MultiState::from_u8(self.state.load(Ordering::Acquire))
    }

    fn set_state(&self, next: MultiState) {
        let prev = MultiState::from_u8(self.state.swap(next as u8, Ordering::AcqRel));
        if prev != next {
            debug!("{:?} pcm state {:?} -> {:?}", self.direction, prev, next);
        }
    }

    /// Wake a transport read parked on the condvar. Must not be called with
    /// the buffer mutex held; the empty critical section orders the state
    /// store before the notify so the waiter cannot miss it.
    fn notify_readers(&self) {
        drop(self.buffer.lock());
        self.cond.notify_all();
    }

    fn wake_transport(&self, value: u64) {
        if let Some(handoff) = self.handoff.lock().as_ref() {
            if let Err(err) = handoff.post(value) {
                warn!("transport wake failed: {}", err);
            }
        }
    }

    fn release_handoff(&self) {
        if self.handoff.lock().take().is_some() {
            self.link.release();
        }
    }
}

/// Multi-client mixer/fan-out attached to one transport PCM. Owned by the
/// transport layer; dropping it terminates the worker.
pub struct Multi {
    shared: Arc<Shared>,
}

impl Multi {
    pub fn new(
        link: Arc<dyn TransportLink>,
        direction: StreamDirection,
        cfg: MultiConfig,
    ) -> Result<Self, MixerError> {
        let cfg = cfg.validated();
        let audio = link.audio();
        Ok(Self {
            shared: Arc::new(Shared {
                link,
                direction,
                cfg,
                audio,
                state: AtomicU8::new(MultiState::Init as u8),
                buffer: Mutex::new(BufferState { mix: None, ready: false }),
                cond: Condvar::new(),
                clients: Mutex::new(ClientSet {
                    clients: Vec::new(),
                    active: 0,
                    geometry: None,
                    worker: None,
                }),
                wakeup: Eventfd::new()?,
                handoff: Mutex::new(None),
            }),
        })
    }

    /// Whether the multi-client path is enabled at all; when false the
    /// transport bypasses this subsystem entirely.
    pub fn enabled(cfg: &MultiConfig) -> bool {
        cfg.enabled
    }

    pub fn state(&self) -> MultiState {
        self.shared.state()
    }

    pub fn client_count(&self) -> usize {
        self.shared.clients.lock().clients.len()
    }

    pub fn active_count(&self) -> usize {
        self.shared.clients.lock().active
    }

    /// Whether any client is in the middle of a drain.
    pub fn is_draining(&self) -> bool {
        self.shared.clients.lock().clients.iter().any(|c| {
            matches!(c.state(), ClientState::Draining | ClientState::Settling)
        })
    }

    pub fn period_bytes(&self) -> usize {
        self.shared
            .clients
            .lock()
            .geometry
            .map(|g| g.period_bytes)
            .unwrap_or(0)
    }

    /// Fix the stream geometry from the transport's transfer granularity
    /// and make every registered client operational.
    pub fn init(&self, transfer_samples: usize) -> Result<(), MixerError> {
        let sh = &self.shared;
        let channels = sh.audio.channels;
        if !SampleFormat::valid_channels(channels) {
            return Err(MixerError::InvalidFormat(format!("{} channels", channels)));
        }
        let period_frames = transfer_samples / channels;
        if period_frames == 0 {
            return Err(MixerError::InvalidFormat(
                "transfer smaller than one frame".into(),
            ));
        }

        let geometry = Geometry {
            period_samples: period_frames * channels,
            period_bytes: period_frames * sh.audio.format.frame_size(channels),
            sample_size: sh.audio.format.sample_size(),
            frame_size: sh.audio.format.frame_size(channels),
            mix_threshold: sh.cfg.mix_threshold,
            client_threshold: sh.cfg.client_threshold,
            drain_settle: Duration::from_nanos(sh.cfg.drain_settle_ns),
        };

        if sh.direction.is_playback() {
            let mix = MixBuffer::new(
                sh.audio.format,
                channels,
                sh.cfg.buffer_periods * period_frames,
                period_frames,
                sh.cfg.mix_threshold,
            )?;
            let mut buffer = sh.buffer.lock();
            buffer.mix = Some(mix);
            buffer.ready = false;
        }

        let mut set = sh.clients.lock();
        set.geometry = Some(geometry);
        set.clients.retain_mut(|c| match c.init(&geometry) {
            Ok(()) => true,
            Err(err) => {
                warn!("client init failed: {}", err);
                false
            }
        });
        set.recount();
        drop(set);

        sh.wakeup.post(1)?;
        Ok(())
    }

    /// Register a new client from its data pipe and control socket.
    pub fn add_client(&self, pipe: OwnedFd, control: OwnedFd) -> Result<(), MixerError> {
        let sh = &self.shared;
        let mut set = sh.clients.lock();
        if set.clients.len() >= sh.cfg.max_clients {
            return Err(MixerError::TooManyClients);
        }

        if !sh.direction.is_playback() && sh.state() == MultiState::Finished {
            // The previous snoop cycle ended; this client starts a new one.
            sh.set_state(MultiState::Init);
        }

        {
            let mut handoff = sh.handoff.lock();
            if handoff.is_none() {
                *handoff = Some(Eventfd::new()?);
            }
        }

        let mut client = Client::new(sh.direction, pipe, control)?;
        if let Some(geometry) = set.geometry {
            client.init(&geometry)?;
        }
        set.clients.push(client);
        set.recount();
        debug!("client added, {} connected", set.clients.len());

        match sh.direction {
            StreamDirection::Playback => {
                if sh.state() == MultiState::Finished {
                    sh.set_state(MultiState::Init);
                }
            }
            StreamDirection::Capture => {
                if sh.state() == MultiState::Init {
                    sh.set_state(MultiState::Running);
                }
            }
        }

        self.start_worker(&mut set)?;
        drop(set);
        sh.wakeup.post(1)?;
        Ok(())
    }

    /// Playback entry point for the transport encoder thread: block until
    /// the worker has refilled the mix, then drain up to one period into
    /// `out`, applying the transport's current per-channel scales.
    pub fn read(&self, out: &mut [u8]) -> Result<usize, MixerError> {
        let sh = &self.shared;
        debug_assert!(sh.direction.is_playback());

        if let Some(handoff) = sh.handoff.lock().as_ref() {
            let _ = handoff.take();
        }
        sh.wakeup.post(1)?;

        let mut buffer = sh.buffer.lock();
        loop {
            match sh.state() {
                MultiState::Running => {
                    if buffer.ready {
                        break;
                    }
                    sh.cond.wait(&mut buffer);
                }
                MultiState::Init => return Err(MixerError::NotReady),
                MultiState::Finished => {
                    drop(buffer);
                    sh.release_handoff();
                    return Ok(0);
                }
                MultiState::Paused => return Err(MixerError::Stream),
            }
        }
        buffer.ready = false;

        let channels = sh.audio.channels;
        let mut scale = [1.0f64; MAX_CHANNELS];
        sh.link.mix_scale(&mut scale[..channels]);

        let mix = buffer.mix.as_mut().ok_or(MixerError::Stream)?;
        Ok(mix.read(out, &scale[..channels]))
    }

    /// Capture entry point for the transport decoder thread: fan `data` out
    /// to every running client. Slow clients lose the frames; a finished
    /// worker releases the hand-off. Returns the samples consumed.
    pub fn write(&self, data: &[u8]) -> usize {
        let sh = &self.shared;
        debug_assert!(!sh.direction.is_playback());

        if sh.state() == MultiState::Finished {
            sh.release_handoff();
            return 0;
        }

        let mut set = sh.clients.lock();
        let Some(geometry) = set.geometry else {
            return 0;
        };
        for client in set.clients.iter_mut() {
            if client.state() == ClientState::Running {
                let _ = client.write(data);
            }
        }
        if set.reap() > 0 {
            drop(set);
            // Let the snoop loop observe the shrunken set.
            let _ = sh.wakeup.post(1);
        }
        data.len() / geometry.sample_size
    }

    /// Cooperative shutdown: post the reserved wake-up value and join the
    /// worker. Idempotent; also run on drop.
    pub fn shutdown(&self) {
        let worker = self.shared.clients.lock().worker.take();
        if let Some(worker) = worker {
            if let Err(err) = self.shared.wakeup.post(WAKEUP_SHUTDOWN) {
                warn!("shutdown wake failed: {}", err);
            }
            let _ = worker.join();
        }
    }

    fn start_worker(&self, set: &mut ClientSet) -> Result<(), MixerError> {
        if set.worker.is_some() {
            return Ok(());
        }
        let shared = Arc::clone(&self.shared);
        let name = if shared.direction.is_playback() { "pcm-mix" } else { "pcm-snoop" };
        let handle = thread::Builder::new()
            .name(name.into())
            .spawn(move || match shared.direction {
                StreamDirection::Playback => mix_loop(&shared),
                StreamDirection::Capture => snoop_loop(&shared),
            })
            .map_err(MixerError::Io)?;
        set.worker = Some(handle);
        Ok(())
    }
}

impl Drop for Multi {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// What a readiness event maps back to.
#[derive(Clone, Copy)]
enum Source {
    Wakeup,
    Pipe(usize),
    Control(usize),
    Timer(usize),
}

/// Rebuild the pollfd set: the wake-up eventfd first, then per client the
/// control socket, the data pipe (playback: only while watched; capture:
/// hang-up detection only) and the drain timer.
fn collect_sources(
    sh: &Shared,
    fds: &mut Vec<libc::pollfd>,
    sources: &mut Vec<Source>,
) {
    fds.clear();
    sources.clear();
    fds.push(events::pollfd(sh.wakeup.as_raw_fd(), libc::POLLIN));
    sources.push(Source::Wakeup);

    let set = sh.clients.lock();
    for (idx, client) in set.clients.iter().enumerate() {
        fds.push(events::pollfd(client.control_fd(), libc::POLLIN));
        sources.push(Source::Control(idx));
        match sh.direction {
            StreamDirection::Playback => {
                if client.watching() {
                    fds.push(events::pollfd(client.pipe_fd(), libc::POLLIN));
                    sources.push(Source::Pipe(idx));
                }
            }
            StreamDirection::Capture => {
                // Data flows the other way; POLLERR/POLLHUP still arrive
                // with an empty event mask.
                fds.push(events::pollfd(client.pipe_fd(), 0));
                sources.push(Source::Pipe(idx));
            }
        }
        if let Some(fd) = client.timer_fd() {
            fds.push(events::pollfd(fd, libc::POLLIN));
            sources.push(Source::Timer(idx));
        }
    }
}

/// Playback worker: single-threaded event dispatch over the wake-up
/// eventfd and every client's descriptors.
fn mix_loop(sh: &Shared) {
    debug!("mix worker up");
    let mut fds: Vec<libc::pollfd> = Vec::new();
    let mut sources: Vec<Source> = Vec::new();

    loop {
        collect_sources(sh, &mut fds, &mut sources);
        if let Err(err) = events::poll(&mut fds) {
            error!("mix loop poll failed: {}", err);
            sh.set_state(MultiState::Finished);
            sh.notify_readers();
            sh.wake_transport(WAKEUP_SHUTDOWN);
            return;
        }

        if fds[0].revents != 0 {
            // Transport wake: one mix refill per wake.
            match sh.wakeup.take() {
                Ok(value) if value >= WAKEUP_SHUTDOWN => break,
                Ok(0) => {}
                Ok(_) => {
                    let mut buffer = sh.buffer.lock();
                    let mut set = sh.clients.lock();
                    if let (Some(mix), Some(geometry)) = (buffer.mix.as_mut(), set.geometry) {
                        for client in set.clients.iter_mut() {
                            client.deliver(mix, &geometry);
                        }
                    }
                    set.recount();
                    buffer.ready = true;
                    sh.cond.notify_all();
                }
                Err(err) => warn!("wakeup read failed: {}", err),
            }
        } else {
            // Client events. Finished clients are only reaped after the
            // whole batch, so the index map stays valid throughout.
            let mut buffer = sh.buffer.lock();
            let mut set = sh.clients.lock();
            let geometry = set.geometry;
            for (pfd, source) in fds.iter().zip(sources.iter()) {
                if pfd.revents == 0 {
                    continue;
                }
                match *source {
                    Source::Wakeup => {}
                    Source::Pipe(idx) => {
                        if let Some(geometry) = &geometry {
                            set.clients[idx].handle_pipe(geometry);
                        }
                    }
                    Source::Control(idx) => {
                        set.clients[idx].handle_control(buffer.mix.as_mut());
                    }
                    Source::Timer(idx) => set.clients[idx].handle_timer(),
                }
            }
            set.reap();
        }

        mix_housekeeping(sh);
    }

    sh.set_state(MultiState::Finished);
    sh.notify_readers();
    sh.wake_transport(WAKEUP_SHUTDOWN);
    debug!("mix worker down");
}

/// The four after-batch steps of the playback loop: end-of-stream, lone
/// client drop flush, start-up threshold, starvation.
fn mix_housekeeping(sh: &Shared) {
    let count = sh.clients.lock().clients.len();
    if count == 0 {
        if sh.state() != MultiState::Finished {
            sh.set_state(MultiState::Finished);
            if let Some(mix) = sh.buffer.lock().mix.as_mut() {
                mix.clear();
            }
            sh.notify_readers();
            sh.link.signal(TransportSignal::Close);
            sh.link.stop_if_no_clients();
            sh.wake_transport(1);
        }
        return;
    }

    // A lone client with a pending drop flushes the whole mix. With more
    // clients connected the flag stays pending; clearing shared accumulator
    // cells would tear the other streams.
    let lone_drop = {
        let mut buffer = sh.buffer.lock();
        let mut set = sh.clients.lock();
        if set.clients.len() == 1 && set.clients[0].take_drop_pending() {
            if let Some(mix) = buffer.mix.as_mut() {
                mix.clear();
            }
            true
        } else {
            false
        }
    };
    if lone_drop {
        sh.link.drop_pending();
    }

    if sh.state() == MultiState::Init {
        let start = {
            let mut buffer = sh.buffer.lock();
            let mut set = sh.clients.lock();
            if set.active == 0 {
                false
            } else if let (Some(mix), Some(geometry)) = (buffer.mix.as_mut(), set.geometry) {
                for client in set.clients.iter_mut() {
                    client.deliver(mix, &geometry);
                }
                set.recount();
                mix.at_threshold()
            } else {
                false
            }
        };
        if start {
            sh.set_state(MultiState::Running);
            sh.wake_transport(1);
        }
    }

    if sh.state() == MultiState::Running {
        let starved = {
            let mut buffer = sh.buffer.lock();
            let starved = buffer.mix.as_ref().map(|m| m.empty()).unwrap_or(true);
            if starved {
                buffer.ready = false;
            }
            starved
        };
        if starved {
            sh.set_state(MultiState::Init);
            sh.notify_readers();
        } else {
            sh.wake_transport(1);
        }
    }
}

/// Capture worker: watches control sockets and pipe hang-ups; the audio
/// fan-out itself happens on the transport decoder thread.
fn snoop_loop(sh: &Shared) {
    debug!("snoop worker up");
    let mut fds: Vec<libc::pollfd> = Vec::new();
    let mut sources: Vec<Source> = Vec::new();

    loop {
        collect_sources(sh, &mut fds, &mut sources);
        if let Err(err) = events::poll(&mut fds) {
            error!("snoop loop poll failed: {}", err);
            sh.set_state(MultiState::Finished);
            sh.wake_transport(WAKEUP_SHUTDOWN);
            return;
        }

        if fds[0].revents != 0 {
            match sh.wakeup.take() {
                Ok(value) if value >= WAKEUP_SHUTDOWN => break,
                Ok(_) => {}
                Err(err) => warn!("wakeup read failed: {}", err),
            }
        } else {
            let mut set = sh.clients.lock();
            for (pfd, source) in fds.iter().zip(sources.iter()) {
                if pfd.revents == 0 {
                    continue;
                }
                match *source {
                    Source::Control(idx) => set.clients[idx].handle_control(None),
                    Source::Pipe(idx) => {
                        if pfd.revents & (libc::POLLERR | libc::POLLHUP) != 0 {
                            set.clients[idx].hang_up();
                        }
                    }
                    _ => {}
                }
            }
            set.reap();
        }

        snoop_housekeeping(sh);
    }

    sh.set_state(MultiState::Finished);
    sh.wake_transport(WAKEUP_SHUTDOWN);
    debug!("snoop worker down");
}

/// After-batch steps of the capture loop: end-of-stream, and parking or
/// resuming the transport as clients pause and resume.
fn snoop_housekeeping(sh: &Shared) {
    let (count, active) = {
        let set = sh.clients.lock();
        (set.clients.len(), set.active)
    };
    if count == 0 {
        if sh.state() != MultiState::Finished {
            sh.set_state(MultiState::Finished);
            sh.link.signal(TransportSignal::Close);
            sh.link.stop_if_no_clients();
        }
        return;
    }

    match sh.state() {
        MultiState::Running if active == 0 => sh.set_state(MultiState::Paused),
        MultiState::Paused if active > 0 => {
            sh.set_state(MultiState::Running);
            sh.link.resume();
        }
        _ => {}
    }
}
