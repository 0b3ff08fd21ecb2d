//! Per-client stream state.
//!
//! Every connected client owns a data pipe, a control socket and (for
//! playback) a one-shot drain timer. All state mutation happens on the
//! dispatcher's worker thread, except the capture fan-out write which runs
//! on the transport decoder thread under the client lock.

use std::os::fd::{AsRawFd, OwnedFd, RawFd};

use tracing::{debug, trace, warn};

use crate::audio::constants::{
    CLIENT_BUFFER_EXTRA_PERIODS, CONTROL_MSG_MAX, REPLY_INVALID, REPLY_OK,
};
use crate::audio::mix::MixBuffer;
use crate::common::errors::MixerError;
use crate::transport::StreamDirection;

use super::Geometry;
use super::events::{self, IoOp, OneShotTimer};

/// Client lifecycle. Playback walks `Init → Idle → Running ⇄ Paused`, with
/// `Running → Draining → Settling → Idle` on a drain; capture goes straight
/// to `Running`. Any state can fall to `Finished` on hang-up or error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ClientState {
    /// Registered, local buffer not yet allocated.
    Init,
    /// Ready, accumulating towards the start threshold.
    Idle,
    Running,
    Paused,
    /// Drain requested; still reading the pipe and feeding the mix.
    Draining,
    /// Pipe fully consumed; waiting out the settle timer.
    Settling,
    Finished,
}

/// Control commands accepted on the client control socket.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Command {
    Drain,
    Drop,
    Pause,
    Resume,
    Unknown,
}

impl Command {
    fn parse(raw: &[u8]) -> Self {
        // Tolerate line-oriented peers: trailing newline and NUL bytes are
        // not part of the command.
        let mut msg = raw;
        while let [head @ .., b'\n' | b'\r' | 0] = msg {
            msg = head;
        }
        match msg {
            b"Drain" => Command::Drain,
            b"Drop" => Command::Drop,
            b"Pause" => Command::Pause,
            b"Resume" => Command::Resume,
            _ => Command::Unknown,
        }
    }
}

/// How a pipe-filling pass ended.
#[derive(Debug, PartialEq, Eq)]
enum FillOutcome {
    /// The pipe has no more data right now.
    PipeEmpty,
    /// The local buffer is full; the pipe watch was disabled.
    BufferFull,
    /// The peer hung up or the pipe errored; the client is finished.
    Closed,
}

pub(crate) struct Client {
    direction: StreamDirection,
    pipe: OwnedFd,
    control: OwnedFd,
    timer: Option<OneShotTimer>,
    /// Pre-period byte buffer (playback only), fixed size after `init`.
    buf: Vec<u8>,
    /// Bytes currently buffered locally.
    in_offset: usize,
    /// Signed sample cursor into the mix; negative means "ahead of the
    /// current mix head by that many samples".
    out_offset: isize,
    /// Mix availability snapshot used to detect the end of a drain.
    drain_avail: usize,
    drop_pending: bool,
    /// Whether the data pipe is currently watched for readiness.
    watch: bool,
    state: ClientState,
}

impl Client {
    pub fn new(
        direction: StreamDirection,
        pipe: OwnedFd,
        control: OwnedFd,
    ) -> Result<Self, MixerError> {
        events::set_nonblocking(pipe.as_raw_fd())?;
        events::set_nonblocking(control.as_raw_fd())?;
        let timer = if direction.is_playback() {
            Some(OneShotTimer::new()?)
        } else {
            None
        };
        Ok(Self {
            direction,
            pipe,
            control,
            timer,
            buf: Vec::new(),
            in_offset: 0,
            out_offset: 0,
            drain_avail: 0,
            drop_pending: false,
            watch: false,
            state: ClientState::Init,
        })
    }

    /// Allocate the local buffer and make the client operational.
    pub fn init(&mut self, geo: &Geometry) -> Result<(), MixerError> {
        match self.direction {
            StreamDirection::Playback => {
                let cap = (geo.client_threshold + CLIENT_BUFFER_EXTRA_PERIODS) * geo.period_bytes;
                let mut buf = Vec::new();
                buf.try_reserve_exact(cap).map_err(|_| MixerError::OutOfMemory)?;
                buf.resize(cap, 0);
                self.buf = buf;
                self.watch = true;
                self.set_state(ClientState::Idle);
            }
            StreamDirection::Capture => self.set_state(ClientState::Running),
        }
        Ok(())
    }

    pub fn state(&self) -> ClientState {
        self.state
    }

    pub fn is_active(&self) -> bool {
        match self.direction {
            StreamDirection::Playback => {
                matches!(self.state, ClientState::Running | ClientState::Draining)
            }
            StreamDirection::Capture => self.state == ClientState::Running,
        }
    }

    pub fn watching(&self) -> bool {
        self.watch
    }

    pub fn pipe_fd(&self) -> RawFd {
        self.pipe.as_raw_fd()
    }

    pub fn control_fd(&self) -> RawFd {
        self.control.as_raw_fd()
    }

    pub fn timer_fd(&self) -> Option<RawFd> {
        self.timer.as_ref().map(|t| t.as_raw_fd())
    }

    /// Check and clear the pending drop request.
    pub fn take_drop_pending(&mut self) -> bool {
        std::mem::take(&mut self.drop_pending)
    }

    // ── Playback ─────────────────────────────────────────────────────────────

    /// The data pipe is readable.
    pub fn handle_pipe(&mut self, geo: &Geometry) {
        if self.state == ClientState::Finished {
            return;
        }
        self.fill_from_pipe();
        if self.state == ClientState::Idle
            && self.in_offset > geo.client_threshold * geo.period_bytes
        {
            self.start_running(geo);
        }
    }

    /// Feed buffered audio into the mix; called whenever the mix wants more.
    pub fn deliver(&mut self, mix: &mut MixBuffer, geo: &Geometry) {
        let mut pipe_empty = false;
        if self.state == ClientState::Draining {
            pipe_empty = self.fill_from_pipe() == FillOutcome::PipeEmpty;
        }

        let mut fed = false;
        if matches!(self.state, ClientState::Running | ClientState::Draining)
            && self.in_offset > 0
        {
            let consumed = mix.add(&mut self.out_offset, &self.buf[..self.in_offset]);
            if consumed > 0 {
                self.buf.copy_within(consumed..self.in_offset, 0);
                self.in_offset -= consumed;
                self.watch = true;
                fed = true;
            }
        }

        // A drain is over once the pipe is dry, no feedable frame remains
        // locally, and the mix has consumed everything this client queued.
        // `avail > drain_avail` means the read cursor lapped the snapshot;
        // a pass that just fed the mix only refreshes the snapshot, since
        // its own bytes raised the water mark.
        if self.state == ClientState::Draining && pipe_empty && self.in_offset < geo.frame_size {
            let avail = mix.avail();
            if fed {
                self.drain_avail = avail;
            } else if avail == 0 || avail > self.drain_avail {
                if let Some(timer) = &self.timer {
                    if let Err(err) = timer.arm(geo.drain_settle) {
                        warn!("drain timer arm failed: {}", err);
                    }
                }
                self.set_state(ClientState::Settling);
            } else {
                self.drain_avail = avail;
            }
        }
    }

    /// The drain settle timer fired.
    pub fn handle_timer(&mut self) {
        if let Some(timer) = &self.timer {
            if let Err(err) = timer.acknowledge() {
                warn!("drain timer read failed: {}", err);
            }
        }
        if self.state == ClientState::Settling {
            self.finish_drain();
        }
    }

    /// A command arrived on the control socket. `mix` is absent for capture.
    pub fn handle_control(&mut self, mix: Option<&mut MixBuffer>) {
        if self.state == ClientState::Finished {
            return;
        }
        let mut raw = [0u8; CONTROL_MSG_MAX];
        let fd = self.control.as_raw_fd();
        let len = match events::read_nonblock(fd, &mut raw) {
            Ok(IoOp::Data(len)) => len,
            Ok(IoOp::WouldBlock) => return,
            Ok(IoOp::Closed) => {
                debug!("control peer hung up");
                self.set_state(ClientState::Finished);
                return;
            }
            Err(err) => {
                warn!("control read failed: {}", err);
                self.set_state(ClientState::Finished);
                return;
            }
        };
        let command = Command::parse(&raw[..len]);
        trace!("control command {:?}", command);
        match self.direction {
            StreamDirection::Playback => {
                if let Some(mix) = mix {
                    self.dispatch_playback(command, mix);
                }
            }
            StreamDirection::Capture => self.dispatch_capture(command),
        }
    }

    fn dispatch_playback(&mut self, command: Command, mix: &mut MixBuffer) {
        // A command overtaking a drain completes the drain first, so the
        // dispatch below starts from a clean Idle.
        if matches!(self.state, ClientState::Draining | ClientState::Settling) {
            self.finish_drain();
        }
        match command {
            Command::Drain => {
                if self.state == ClientState::Running {
                    self.watch = false;
                    self.drain_avail = mix.avail();
                    self.set_state(ClientState::Draining);
                    // Ack deferred until the settle timer fires.
                } else {
                    self.reply(REPLY_OK);
                }
            }
            Command::Drop => {
                if let Some(timer) = &self.timer {
                    let _ = timer.disarm();
                }
                self.discard_pipe();
                self.in_offset = 0;
                if self.state != ClientState::Finished {
                    self.drop_pending = true;
                    self.set_state(ClientState::Idle);
                    self.reply(REPLY_OK);
                }
            }
            Command::Pause => {
                self.watch = false;
                // Keep the lead over the mix head constant while paused, so
                // a resume re-enters right at the head plus the queued tail.
                self.out_offset = -(mix.delay(self.out_offset) as isize);
                self.set_state(ClientState::Paused);
                self.reply(REPLY_OK);
            }
            Command::Resume => {
                match self.state {
                    ClientState::Idle => {
                        self.watch = true;
                        self.drop_pending = false;
                    }
                    ClientState::Paused => {
                        self.watch = true;
                        self.set_state(ClientState::Running);
                    }
                    _ => {}
                }
                self.reply(REPLY_OK);
            }
            Command::Unknown => self.reply(REPLY_INVALID),
        }
    }

    fn dispatch_capture(&mut self, command: Command) {
        match command {
            Command::Pause => {
                self.set_state(ClientState::Paused);
                self.reply(REPLY_OK);
            }
            Command::Resume => {
                if self.state == ClientState::Paused {
                    self.set_state(ClientState::Running);
                }
                self.reply(REPLY_OK);
            }
            // Nothing is queued on the capture side; ack and stay.
            Command::Drain | Command::Drop => self.reply(REPLY_OK),
            Command::Unknown => self.reply(REPLY_INVALID),
        }
    }

    // ── Capture ──────────────────────────────────────────────────────────────

    /// The peer hung up its end of the data pipe.
    pub fn hang_up(&mut self) {
        debug!("data pipe hung up");
        self.set_state(ClientState::Finished);
    }

    /// Best-effort non-blocking fan-out write from the transport decoder.
    /// A slow peer loses the frames in flight; an audible glitch beats
    /// stalling the decoder.
    pub fn write(&mut self, data: &[u8]) -> Result<usize, MixerError> {
        let fd = self.pipe.as_raw_fd();
        match events::write_nonblock(fd, data) {
            Ok(IoOp::Data(len)) => {
                if len < data.len() {
                    warn!("capture client overrun, dropped {} bytes", data.len() - len);
                }
                Ok(len)
            }
            Ok(IoOp::WouldBlock) => {
                warn!("capture client overrun, dropped {} bytes", data.len());
                Err(MixerError::Overrun)
            }
            Ok(IoOp::Closed) => {
                self.set_state(ClientState::Finished);
                Err(MixerError::PeerClosed)
            }
            Err(err) => {
                debug!("capture client write failed: {}", err);
                self.set_state(ClientState::Finished);
                Err(MixerError::Io(err))
            }
        }
    }

    // ── Internals ────────────────────────────────────────────────────────────

    /// Read the pipe into the tail of the local buffer until the pipe is
    /// dry, the buffer is full, or the peer goes away.
    fn fill_from_pipe(&mut self) -> FillOutcome {
        let fd = self.pipe.as_raw_fd();
        loop {
            if self.in_offset >= self.buf.len() {
                // Stop watching until the mix frees some room; the peer
                // now blocks (or sees EAGAIN) on its end of the pipe.
                self.watch = false;
                return FillOutcome::BufferFull;
            }
            match events::read_nonblock(fd, &mut self.buf[self.in_offset..]) {
                Ok(IoOp::Data(len)) => self.in_offset += len,
                Ok(IoOp::WouldBlock) => return FillOutcome::PipeEmpty,
                Ok(IoOp::Closed) => {
                    debug!("data pipe closed by peer");
                    self.set_state(ClientState::Finished);
                    return FillOutcome::Closed;
                }
                Err(err) => {
                    warn!("data pipe read failed: {}", err);
                    self.set_state(ClientState::Finished);
                    return FillOutcome::Closed;
                }
            }
        }
    }

    /// Enter `Running`, placing the write head the mix pre-roll's worth of
    /// periods ahead of the mix head, less what is already buffered.
    fn start_running(&mut self, geo: &Geometry) {
        let buffered = self.in_offset / geo.sample_size;
        let lead = (geo.mix_threshold * geo.period_samples).saturating_sub(buffered);
        self.out_offset = -(lead as isize);
        self.set_state(ClientState::Running);
    }

    /// Wind down a drain: back to `Idle` and ack the drain request.
    fn finish_drain(&mut self) {
        if let Some(timer) = &self.timer {
            let _ = timer.disarm();
        }
        self.in_offset = 0;
        self.watch = true;
        self.set_state(ClientState::Idle);
        self.reply(REPLY_OK);
    }

    /// Flush whatever the peer has queued on the pipe into the void.
    fn discard_pipe(&mut self) {
        let fd = self.pipe.as_raw_fd();
        let mut scratch = [0u8; 4096];
        loop {
            match events::read_nonblock(fd, &mut scratch) {
                Ok(IoOp::Data(_)) => continue,
                Ok(IoOp::WouldBlock) => return,
                Ok(IoOp::Closed) => {
                    self.set_state(ClientState::Finished);
                    return;
                }
                Err(err) => {
                    warn!("pipe discard failed: {}", err);
                    self.set_state(ClientState::Finished);
                    return;
                }
            }
        }
    }

    fn reply(&mut self, msg: &[u8]) {
        let fd = self.control.as_raw_fd();
        match events::send_nonblock(fd, msg) {
            Ok(IoOp::Data(_)) => {}
            Ok(IoOp::WouldBlock) => warn!("control reply dropped, socket full"),
            Ok(IoOp::Closed) => self.set_state(ClientState::Finished),
            Err(err) => {
                debug!("control reply failed: {}", err);
                self.set_state(ClientState::Finished);
            }
        }
    }

    fn set_state(&mut self, next: ClientState) {
        if self.state != next {
            trace!("client state {:?} -> {:?}", self.state, next);
            self.state = next;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::format::SampleFormat;
    use std::os::fd::FromRawFd;
    use std::time::Duration;

    fn pipe_pair() -> (OwnedFd, OwnedFd) {
        let mut fds = [0i32; 2];
        assert_eq!(unsafe { libc::pipe2(fds.as_mut_ptr(), libc::O_CLOEXEC) }, 0);
        unsafe {
            (
                OwnedFd::from_raw_fd(fds[0]),
                OwnedFd::from_raw_fd(fds[1]),
            )
        }
    }

    fn socket_pair() -> (OwnedFd, OwnedFd) {
        let mut fds = [0i32; 2];
        let rc = unsafe {
            libc::socketpair(
                libc::AF_UNIX,
                libc::SOCK_SEQPACKET | libc::SOCK_CLOEXEC,
                0,
                fds.as_mut_ptr(),
            )
        };
        assert_eq!(rc, 0);
        unsafe {
            (
                OwnedFd::from_raw_fd(fds[0]),
                OwnedFd::from_raw_fd(fds[1]),
            )
        }
    }

    /// Stereo S16 with 8-frame periods.
    fn geometry() -> Geometry {
        Geometry {
            period_samples: 16,
            period_bytes: 32,
            sample_size: 2,
            frame_size: 4,
            mix_threshold: 3,
            client_threshold: 2,
            drain_settle: Duration::from_millis(10),
        }
    }

    fn mix() -> MixBuffer {
        MixBuffer::new(SampleFormat::S16Le, 2, 64, 8, 3).unwrap()
    }

    fn write_fd(fd: &OwnedFd, data: &[u8]) {
        let n = unsafe {
            libc::write(fd.as_raw_fd(), data.as_ptr() as *const libc::c_void, data.len())
        };
        assert_eq!(n, data.len() as isize);
    }

    fn read_fd(fd: &OwnedFd, len: usize) -> Vec<u8> {
        let mut buf = vec![0u8; len];
        let n = unsafe {
            libc::read(fd.as_raw_fd(), buf.as_mut_ptr() as *mut libc::c_void, buf.len())
        };
        assert!(n >= 0);
        buf.truncate(n as usize);
        buf
    }

    fn playback_client() -> (Client, OwnedFd, OwnedFd) {
        let (pipe_r, pipe_w) = pipe_pair();
        let (ctl_ours, ctl_peer) = socket_pair();
        let mut client = Client::new(StreamDirection::Playback, pipe_r, ctl_ours).unwrap();
        client.init(&geometry()).unwrap();
        (client, pipe_w, ctl_peer)
    }

    #[test]
    fn parse_commands() {
        assert_eq!(Command::parse(b"Drain"), Command::Drain);
        assert_eq!(Command::parse(b"Drop\n"), Command::Drop);
        assert_eq!(Command::parse(b"Pause\r\n"), Command::Pause);
        assert_eq!(Command::parse(b"Resume\0"), Command::Resume);
        assert_eq!(Command::parse(b"Rewind"), Command::Unknown);
        assert_eq!(Command::parse(b""), Command::Unknown);
    }

    #[test]
    fn init_enables_watch_and_idles() {
        let (client, _pipe, _ctl) = playback_client();
        assert_eq!(client.state(), ClientState::Idle);
        assert!(client.watching());
        assert_eq!(client.buf.len(), 3 * 32);
    }

    #[test]
    fn idle_promotes_past_threshold() {
        let (mut client, pipe, _ctl) = playback_client();
        let geo = geometry();

        // Exactly the threshold is not enough.
        write_fd(&pipe, &[0u8; 64]);
        client.handle_pipe(&geo);
        assert_eq!(client.state(), ClientState::Idle);

        // One more frame tips it over; the pre-roll lead reflects what is
        // already buffered: 3 periods minus 34 samples.
        write_fd(&pipe, &[0u8; 4]);
        client.handle_pipe(&geo);
        assert_eq!(client.state(), ClientState::Running);
        assert_eq!(client.out_offset, -(48 - 34));
    }

    #[test]
    fn pipe_eof_finishes_client() {
        let (mut client, pipe, _ctl) = playback_client();
        drop(pipe);
        client.handle_pipe(&geometry());
        assert_eq!(client.state(), ClientState::Finished);
    }

    #[test]
    fn full_buffer_drops_watch() {
        let (mut client, pipe, _ctl) = playback_client();
        write_fd(&pipe, &[7u8; 3 * 32]);
        client.handle_pipe(&geometry());
        assert_eq!(client.in_offset, 96);
        assert!(!client.watching());
    }

    #[test]
    fn deliver_feeds_mix_and_compacts() {
        let (mut client, pipe, _ctl) = playback_client();
        let geo = geometry();
        let mut mix = mix();

        write_fd(&pipe, &[1u8; 96]);
        client.handle_pipe(&geo);
        assert_eq!(client.state(), ClientState::Running);
        assert!(!client.watching());

        client.deliver(&mut mix, &geo);
        assert_eq!(client.in_offset, 0);
        assert!(client.watching());
        assert!(mix.at_threshold());
    }

    #[test]
    fn pause_snaps_cursor_and_acks() {
        let (mut client, pipe, ctl) = playback_client();
        let geo = geometry();
        let mut mix = mix();

        write_fd(&pipe, &[1u8; 96]);
        client.handle_pipe(&geo);
        client.deliver(&mut mix, &geo);

        write_fd(&ctl, b"Pause");
        client.handle_control(Some(&mut mix));
        assert_eq!(client.state(), ClientState::Paused);
        assert!(!client.watching());
        // All 48 queued samples stay ahead of the mix head.
        assert_eq!(client.out_offset, -48);
        assert_eq!(read_fd(&ctl, 16), b"OK");

        write_fd(&ctl, b"Resume");
        client.handle_control(Some(&mut mix));
        assert_eq!(client.state(), ClientState::Running);
        assert!(client.watching());
        assert_eq!(read_fd(&ctl, 16), b"OK");
    }

    #[test]
    fn unknown_command_is_invalid() {
        let (mut client, _pipe, ctl) = playback_client();
        let mut mix = mix();
        write_fd(&ctl, b"FastForward");
        client.handle_control(Some(&mut mix));
        assert_eq!(read_fd(&ctl, 16), b"Invalid");
    }

    #[test]
    fn drop_discards_and_flags() {
        let (mut client, pipe, ctl) = playback_client();
        let geo = geometry();
        let mut mix = mix();

        write_fd(&pipe, &[1u8; 96]);
        client.handle_pipe(&geo);
        write_fd(&pipe, &[1u8; 32]);

        write_fd(&ctl, b"Drop");
        client.handle_control(Some(&mut mix));
        assert_eq!(client.state(), ClientState::Idle);
        assert!(client.drop_pending);
        assert_eq!(client.in_offset, 0);
        assert_eq!(read_fd(&ctl, 16), b"OK");

        // The pending pipe bytes went to the discard sink; a fresh pipe
        // pass finds nothing and the client stays idle.
        client.handle_pipe(&geo);
        assert_eq!(client.state(), ClientState::Idle);
        assert_eq!(client.in_offset, 0);
    }

    #[test]
    fn drain_walks_to_idle() {
        let (mut client, pipe, ctl) = playback_client();
        let geo = geometry();
        let mut mix = mix();

        write_fd(&pipe, &[1u8; 80]);
        client.handle_pipe(&geo);
        assert_eq!(client.state(), ClientState::Running);

        write_fd(&ctl, b"Drain");
        client.handle_control(Some(&mut mix));
        assert_eq!(client.state(), ClientState::Draining);
        assert!(!client.watching());

        // Feed everything into the mix, then drain the mix dry.
        client.deliver(&mut mix, &geo);
        let mut out = vec![0u8; 32];
        while mix.read(&mut out, &[1.0, 1.0]) > 0 {}

        client.deliver(&mut mix, &geo);
        assert_eq!(client.state(), ClientState::Settling);

        // The ack only goes out when the settle timer fires.
        std::thread::sleep(Duration::from_millis(30));
        client.handle_timer();
        assert_eq!(client.state(), ClientState::Idle);
        assert_eq!(read_fd(&ctl, 16), b"OK");
    }

    #[test]
    fn control_hangup_finishes_client() {
        let (mut client, _pipe, ctl) = playback_client();
        let mut mix = mix();
        drop(ctl);
        client.handle_control(Some(&mut mix));
        assert_eq!(client.state(), ClientState::Finished);
    }

    #[test]
    fn capture_write_fans_out() {
        let (pipe_r, pipe_w) = pipe_pair();
        let (ctl_ours, _ctl_peer) = socket_pair();
        let mut client = Client::new(StreamDirection::Capture, pipe_w, ctl_ours).unwrap();
        client.init(&geometry()).unwrap();
        assert_eq!(client.state(), ClientState::Running);

        assert_eq!(client.write(&[9u8; 32]).unwrap(), 32);
        assert_eq!(read_fd(&pipe_r, 64), [9u8; 32]);
    }

    #[test]
    fn capture_overrun_drops_frames() {
        let (_pipe_r, pipe_w) = pipe_pair();
        let (ctl_ours, _ctl_peer) = socket_pair();
        // Shrink the pipe so it fills quickly.
        unsafe { libc::fcntl(pipe_w.as_raw_fd(), libc::F_SETPIPE_SZ, 4096) };
        let mut client = Client::new(StreamDirection::Capture, pipe_w, ctl_ours).unwrap();
        client.init(&geometry()).unwrap();

        let chunk = [0u8; 4096];
        client.write(&chunk).unwrap();
        assert!(matches!(client.write(&chunk), Err(MixerError::Overrun)));
        // Dropping frames is not fatal; the client keeps running.
        assert_eq!(client.state(), ClientState::Running);
    }
}
