//! Sockets and the event loop.
//!
//! One poll call at the top of the loop is the daemon's only blocking
//! point, bounded by the next scheduled deadline. Sends are non-blocking:
//! a short write parks the remainder on the face and the face is watched
//! for write readiness until it drains. Datagram peers get their own faces,
//! keyed by source address, sharing the bound socket.

use crate::error::CcndError;
use crate::face::{Face, FaceFlags};
use crate::forwarder::Ccnd;
use crate::framing;
use log::{debug, info, warn};
use polling::{Event as PollEvent, Events, Poller};
use std::collections::HashMap;
use std::io::{ErrorKind, Read, Write};
use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr, UdpSocket};
use std::os::fd::{AsFd, AsRawFd};
use std::os::unix::net::{UnixListener, UnixStream};
use std::path::{Path, PathBuf};
use std::rc::Rc;
use std::time::{Duration, Instant};

/// The transport under a face, when it has one. Datagram peer faces share
/// the bound socket of their parent.
pub enum FaceSock {
    Stream(UnixStream),
    Dgram(Rc<UdpSocket>),
}

const LISTENER_KEY: usize = usize::MAX;
const MAX_POLL_WAIT: Duration = Duration::from_secs(1);
const RECV_CHUNK: usize = 8192;

/// Sends bytes on a face, immediately when nothing is queued, otherwise
/// deferred behind the queue. Only a fatal stream error is returned; a
/// failed datagram send just drops the message.
pub fn face_send(face: &mut Face, bytes: &[u8]) -> Result<(), CcndError> {
    if face.has_pending_output() {
        face.defer_send(bytes);
        return Ok(());
    }

    let wrote = match &face.sock {
        // No transport attached: the queue is the destination.
        None => None,
        Some(FaceSock::Stream(stream)) => {
            let mut s = stream;
            match s.write(bytes) {
                Ok(n) => Some(Ok(n)),
                Err(e)
                    if e.kind() == ErrorKind::WouldBlock
                        || e.kind() == ErrorKind::Interrupted =>
                {
                    Some(Ok(0))
                }
                Err(e) => Some(Err(e)),
            }
        }
        Some(FaceSock::Dgram(sock)) => {
            if let Some(addr) = face.peer {
                if let Err(e) = sock.send_to(bytes, addr) {
                    debug!("datagram send to {addr} failed, message dropped: {e}");
                }
            }
            Some(Ok(bytes.len()))
        }
    };

    match wrote {
        None => {
            face.defer_send(bytes);
            Ok(())
        }
        Some(Ok(n)) if n >= bytes.len() => Ok(()),
        Some(Ok(n)) => {
            face.defer_send(&bytes[n..]);
            Ok(())
        }
        Some(Err(e)) => Err(CcndError::Io(e)),
    }
}

/// Drains a face's deferred output as far as the socket allows.
pub fn flush_face(face: &mut Face) -> Result<(), CcndError> {
    loop {
        let pending = match (&face.sock, &face.outbuf) {
            (Some(FaceSock::Stream(_)), Some(buf)) if buf.len() > face.outbufindex => {
                buf.len() - face.outbufindex
            }
            _ => {
                if face.outbuf.is_some() && !face.has_pending_output() {
                    face.outbuf = None;
                    face.outbufindex = 0;
                }
                return Ok(());
            }
        };

        let result = match (&face.sock, &face.outbuf) {
            (Some(FaceSock::Stream(stream)), Some(buf)) => {
                let mut s = stream;
                s.write(&buf[face.outbufindex..])
            }
            _ => return Ok(()),
        };

        match result {
            Ok(n) => {
                face.outbufindex += n;
                if n == 0 || n < pending {
                    return Ok(());
                }
            }
            Err(e)
                if e.kind() == ErrorKind::WouldBlock || e.kind() == ErrorKind::Interrupted =>
            {
                return Ok(())
            }
            Err(e) => return Err(CcndError::Io(e)),
        }
    }
}

/// The poll-driven event loop over the listener, the bound datagram
/// sockets and every connected face.
pub struct EventLoop {
    poller: Poller,
    events: Events,
    listener: UnixListener,
    listener_path: PathBuf,
    peers: HashMap<SocketAddr, u32>,
    epoch: Instant,
    last_path_check: Instant,
}

impl EventLoop {
    /// Binds the local listener and the per-family datagram sockets,
    /// enrolling a passive face for each datagram socket.
    pub fn bind(h: &mut Ccnd, sock_path: &Path, port: u16) -> Result<Self, CcndError> {
        let listener = UnixListener::bind(sock_path)?;
        listener.set_nonblocking(true)?;

        for addr in [
            SocketAddr::from((Ipv4Addr::UNSPECIFIED, port)),
            SocketAddr::from((Ipv6Addr::UNSPECIFIED, port)),
        ] {
            match UdpSocket::bind(addr) {
                Ok(sock) => {
                    sock.set_nonblocking(true)?;
                    let face = Face::new(FaceFlags::DGRAM | FaceFlags::PASSIVE)
                        .with_sock(FaceSock::Dgram(Rc::new(sock)));
                    h.add_face(face)?;
                }
                Err(e) => warn!("cannot bind datagram socket on {addr}: {e}"),
            }
        }

        let now = Instant::now();
        Ok(EventLoop {
            poller: Poller::new()?,
            events: Events::new(),
            listener,
            listener_path: sock_path.to_path_buf(),
            peers: HashMap::new(),
            epoch: now,
            last_path_check: now,
        })
    }

    /// Runs until `should_stop` reports a signal or the listener path
    /// disappears (in which case None is returned for a clean exit).
    pub fn run(
        &mut self,
        h: &mut Ccnd,
        should_stop: impl Fn() -> Option<i32>,
    ) -> std::io::Result<Option<i32>> {
        loop {
            if let Some(sig) = should_stop() {
                return Ok(Some(sig));
            }

            h.now_us = self.epoch.elapsed().as_micros() as u64;
            h.run_due();

            if self.last_path_check.elapsed() >= Duration::from_secs(1) {
                self.last_path_check = Instant::now();
                if !self.listener_path.exists() {
                    info!("listener path is gone, shutting down");
                    return Ok(None);
                }
            }

            self.peers.retain(|_, id| h.faces.lookup(*id).is_some());

            // Register, wait, then deregister everything again: with the
            //  set torn down before dispatch, handlers are free to destroy
            //  faces without poller bookkeeping.
            unsafe {
                self.poller
                    .add(self.listener.as_raw_fd(), PollEvent::readable(LISTENER_KEY))?;
            }
            let mut registered = Vec::new();
            for face in h.faces.iter() {
                let interest = if face.has_pending_output() {
                    PollEvent::all(face.id as usize)
                } else {
                    PollEvent::readable(face.id as usize)
                };
                let added = match &face.sock {
                    Some(FaceSock::Stream(stream)) => {
                        Some(unsafe { self.poller.add(stream.as_raw_fd(), interest) })
                    }
                    Some(FaceSock::Dgram(sock)) if face.flags.contains(FaceFlags::PASSIVE) => {
                        Some(unsafe { self.poller.add(sock.as_raw_fd(), interest) })
                    }
                    _ => None,
                };
                match added {
                    Some(Ok(())) => registered.push(face.id),
                    Some(Err(e)) => debug!("cannot watch face {:#x}: {e}", face.id),
                    None => {}
                }
            }

            let timeout = match h.sched.next_deadline() {
                Some(at) => Duration::from_micros(at.saturating_sub(h.now_us)).min(MAX_POLL_WAIT),
                None => MAX_POLL_WAIT,
            };
            self.events.clear();
            let wait = self.poller.wait(&mut self.events, Some(timeout));

            let _ = self.poller.delete(self.listener.as_fd());
            for id in registered {
                if let Some(face) = h.faces.lookup(id) {
                    match &face.sock {
                        Some(FaceSock::Stream(stream)) => {
                            let _ = self.poller.delete(stream.as_fd());
                        }
                        Some(FaceSock::Dgram(sock)) => {
                            let _ = self.poller.delete(sock.as_fd());
                        }
                        None => {}
                    }
                }
            }
            wait?;

            h.now_us = self.epoch.elapsed().as_micros() as u64;

            let ready: Vec<PollEvent> = self.events.iter().collect();
            for ev in ready {
                if ev.key == LISTENER_KEY {
                    self.accept_clients(h);
                    continue;
                }
                let faceid = ev.key as u32;
                if ev.writable {
                    Self::handle_writable(h, faceid);
                }
                if ev.readable {
                    self.handle_readable(h, faceid);
                }
            }
        }
    }

    fn accept_clients(&mut self, h: &mut Ccnd) {
        loop {
            match self.listener.accept() {
                Ok((stream, _)) => {
                    if stream.set_nonblocking(true).is_err() {
                        continue;
                    }
                    let face = Face::new(FaceFlags::LOCAL).with_sock(FaceSock::Stream(stream));
                    if let Err(e) = h.add_face(face) {
                        warn!("rejecting client: {e}");
                    }
                }
                Err(e) if e.kind() == ErrorKind::WouldBlock => break,
                Err(e) => {
                    warn!("accept failed: {e}");
                    break;
                }
            }
        }
    }

    fn handle_writable(h: &mut Ccnd, faceid: u32) {
        let result = match h.faces.lookup_mut(faceid) {
            Some(face) => flush_face(face),
            None => return,
        };
        if let Err(e) = result {
            debug!("flush to face {faceid:#x} failed: {e}");
            h.destroy_face(faceid);
        }
    }

    fn handle_readable(&mut self, h: &mut Ccnd, faceid: u32) {
        let passive_dgram = match h.faces.lookup(faceid) {
            Some(face) => face.flags.contains(FaceFlags::PASSIVE),
            None => return,
        };
        if passive_dgram {
            self.recv_datagrams(h, faceid);
        } else {
            Self::recv_stream(h, faceid);
        }
    }

    fn recv_stream(h: &mut Ccnd, faceid: u32) {
        let mut closed = false;
        if let Some(face) = h.faces.lookup_mut(faceid) {
            let mut chunk = [0u8; RECV_CHUNK];
            loop {
                let got = match &face.sock {
                    Some(FaceSock::Stream(stream)) => {
                        let mut s = stream;
                        s.read(&mut chunk)
                    }
                    _ => break,
                };
                match got {
                    Ok(0) => {
                        closed = true;
                        break;
                    }
                    Ok(n) => {
                        face.inbuf.extend_from_slice(&chunk[..n]);
                        if n < chunk.len() {
                            break;
                        }
                    }
                    Err(e) if e.kind() == ErrorKind::WouldBlock => break,
                    Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                    Err(e) => {
                        debug!("read from face {faceid:#x} failed: {e}");
                        closed = true;
                        break;
                    }
                }
            }
        }

        framing::process_face(h, faceid);
        if closed {
            h.destroy_face(faceid);
        }
    }

    fn recv_datagrams(&mut self, h: &mut Ccnd, faceid: u32) {
        let sock = match h.faces.lookup(faceid) {
            Some(Face {
                sock: Some(FaceSock::Dgram(sock)),
                ..
            }) => Rc::clone(sock),
            _ => return,
        };

        let mut buf = [0u8; crate::MAX_MESSAGE_BYTES + 1];
        loop {
            match sock.recv_from(&mut buf) {
                Ok((n, from)) => {
                    let peer_face = match self.peers.get(&from) {
                        Some(id) if h.faces.lookup(*id).is_some() => *id,
                        _ => {
                            let face = Face::new(FaceFlags::DGRAM)
                                .with_sock(FaceSock::Dgram(Rc::clone(&sock)))
                                .with_peer(from);
                            match h.add_face(face) {
                                Ok(id) => {
                                    self.peers.insert(from, id);
                                    id
                                }
                                Err(e) => {
                                    warn!("rejecting datagram peer {from}: {e}");
                                    continue;
                                }
                            }
                        }
                    };
                    framing::process_datagram(h, peer_face, &buf[..n]);
                }
                Err(e) if e.kind() == ErrorKind::WouldBlock => break,
                Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                Err(e) => {
                    debug!("datagram receive failed: {e}");
                    break;
                }
            }
        }
    }
}
