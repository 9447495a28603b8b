use std::net::{Ipv4Addr, SocketAddrV4};
use std::os::fd::{AsRawFd, RawFd};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use embassy_time::Instant;

use log::{debug, trace, warn};

use rand::rngs::StdRng;
use rand::SeedableRng;

use dhcplink_proto::ident::ClientIdent;
use dhcplink_proto::options::Options;
use dhcplink_proto::packet::Packet;
use dhcplink_proto::probe::{
    Action, Actions, MessageKind, Probe as ProbeMachine, ProbeEvent, SendDest,
};
use dhcplink_proto::{CLIENT_PORT, SERVER_PORT};

use crate::clock::{Clock, MonotonicClock};
use crate::config::{ClientConfig, ProbeConfig};
use crate::lease::Lease;
use crate::poll::{Poll, TOKEN_RAW, TOKEN_TIMER, TOKEN_UDP};
use crate::queue::{Event, EventQueue};
use crate::socket::{is_transient, ChecksumState, RawSocket, UdpSocket};
use crate::timer::TimerFd;
use crate::Error;

/// Handle to an acquisition attempt started with [`Client::probe`].
///
/// The probe runs for as long as the handle lives: dropping it (or calling
/// [`Probe::cancel`]) cancels the probe at the next [`Client::dispatch`],
/// emitting [`Event::Cancelled`] and releasing the probe's sockets. A host
/// that wants the lease lifecycle to keep running holds on to the handle.
pub struct Probe {
    shared: Arc<ProbeShared>,
}

impl Probe {
    pub fn cancel(&self) {
        self.shared.cancel.store(true, Ordering::Relaxed);
    }
}

impl Drop for Probe {
    fn drop(&mut self) {
        self.cancel();
    }
}

struct ProbeShared {
    cancel: AtomicBool,
}

struct ActiveProbe {
    machine: ProbeMachine<StdRng>,
    shared: Arc<ProbeShared>,
}

/// A DHCPv4 client for one network interface.
///
/// The client owns no event loop and never blocks: the host adds
/// [`Client::fd`] to its poll set, calls [`Client::dispatch`] whenever it
/// polls readable, and drains [`Client::pop_event`] afterwards. All
/// timing, retransmission and server selection runs inside `dispatch`.
pub struct Client {
    config: ClientConfig,
    ident: ClientIdent,
    clock: Box<dyn Clock>,
    poll: Poll,
    timer: TimerFd,
    raw: Option<RawSocket>,
    udp: Option<UdpSocket>,
    active: Option<ActiveProbe>,
    events: EventQueue,
    disabled: bool,
    recv_buf: Vec<u8>,
    frame_buf: Vec<u8>,
}

impl AsRawFd for Client {
    fn as_raw_fd(&self) -> RawFd {
        self.poll.as_raw_fd()
    }
}

impl Client {
    pub fn new(mut config: ClientConfig) -> Result<Self, Error> {
        let ident = config.validate()?;
        let clock = config
            .clock
            .take()
            .unwrap_or_else(|| Box::new(MonotonicClock::new()));

        let poll = Poll::new().map_err(Error::Io)?;
        let timer = TimerFd::new().map_err(Error::Io)?;
        poll.register(timer.as_raw_fd(), TOKEN_TIMER).map_err(Error::Io)?;

        let frame_len = buffer_len(config.mtu);
        let events = EventQueue::new(config.event_capacity);

        Ok(Self {
            ident,
            clock,
            poll,
            timer,
            raw: None,
            udp: None,
            active: None,
            events,
            disabled: false,
            recv_buf: vec![0; frame_len],
            frame_buf: vec![0; frame_len],
            config,
        })
    }

    /// The descriptor the host adds to its poll set; readable whenever a
    /// [`Client::dispatch`] would do work
    pub fn fd(&self) -> RawFd {
        self.poll.as_raw_fd()
    }

    /// Next pending notification, in production order
    pub fn pop_event(&mut self) -> Option<Event> {
        self.events.pop()
    }

    /// Starts an acquisition attempt; at most one per client.
    ///
    /// Fails with [`Error::Preempted`] while a probe is active.
    pub fn probe(&mut self, config: ProbeConfig) -> Result<Probe, Error> {
        if self.disabled {
            return Err(Error::Disabled);
        }

        if self
            .active
            .as_ref()
            .map(|active| active.machine.is_active())
            .unwrap_or(false)
        {
            return Err(Error::Preempted);
        }

        let opts = config.to_probe_options(&self.config)?;

        let machine = ProbeMachine::new(self.ident.clone(), opts, StdRng::from_entropy());
        let shared = Arc::new(ProbeShared {
            cancel: AtomicBool::new(false),
        });

        self.active = Some(ActiveProbe {
            machine,
            shared: shared.clone(),
        });

        let now = self.now();
        let actions = self.active.as_mut().unwrap().machine.start(now);

        if let Err(err) = self.run_actions(actions, None) {
            self.active = None;
            self.close_raw();
            self.close_udp();
            return Err(err);
        }

        self.rearm_timer()?;

        Ok(Probe { shared })
    }

    /// Non-blocking, non-reentrant work loop entry: drains inbound
    /// packets, then fires expired timers, then rearms. Inbound beats
    /// timers so a reply arriving alongside an expired retransmission
    /// timer wins.
    pub fn dispatch(&mut self) -> Result<(), Error> {
        if self.disabled {
            return Err(Error::Disabled);
        }

        match self.dispatch_inner() {
            Ok(()) => Ok(()),
            Err(err) => {
                warn!("Fatal dispatch error, disabling client: {}", err);

                self.disabled = true;
                self.teardown();
                self.events.push(Event::Down);

                Err(err)
            }
        }
    }

    /// Promotes an offered lease to REQUESTING
    pub fn select(&mut self, lease: &Lease) -> Result<(), Error> {
        if self.disabled {
            return Err(Error::Disabled);
        }

        let now = self.now();

        let Some(active) = self.active.as_mut() else {
            return Ok(());
        };

        let actions = active.machine.select(lease.info(), now);
        self.run_actions(actions, None)?;
        self.rearm_timer()
    }

    /// Confirms a granted lease; call before considering the host
    /// configured
    pub fn accept(&mut self, _lease: &Lease) {
        if let Some(active) = self.active.as_mut() {
            active.machine.accept();
        }
    }

    /// Rejects a granted address with a DHCPDECLINE (e.g. after detecting
    /// an ARP collision) and returns the probe to INIT
    pub fn decline(&mut self, _lease: &Lease) -> Result<(), Error> {
        if self.disabled {
            return Err(Error::Disabled);
        }

        let now = self.now();

        let Some(active) = self.active.as_mut() else {
            return Ok(());
        };

        let actions = active.machine.decline(now);
        self.run_actions(actions, None)?;
        self.rearm_timer()
    }

    /// Hands the lease back to its server with a DHCPRELEASE and returns
    /// the probe to INIT; fire and forget
    pub fn release(&mut self, _lease: &Lease) -> Result<(), Error> {
        if self.disabled {
            return Err(Error::Disabled);
        }

        let now = self.now();

        let Some(active) = self.active.as_mut() else {
            return Ok(());
        };

        let actions = active.machine.release(now);
        self.run_actions(actions, None)?;
        self.rearm_timer()
    }

    /// Adjusts the maximum DHCP payload to a changed interface MTU;
    /// affects whether options spill into the overloaded header fields
    pub fn update_mtu(&mut self, mtu: u16) {
        self.config.mtu = mtu;

        let max = self.config.max_message_size();
        if let Some(active) = self.active.as_mut() {
            active.machine.set_max_message_size(max);
        }

        let frame_len = buffer_len(mtu);
        self.recv_buf.resize(frame_len, 0);
        self.frame_buf.resize(frame_len, 0);
    }

    fn dispatch_inner(&mut self) -> Result<(), Error> {
        let ready = self.poll.ready().map_err(Error::Io)?;

        if ready.timer {
            self.timer.clear();
        }

        // A dropped or cancelled handle takes effect here, synchronously
        let cancelled = self
            .active
            .as_ref()
            .map(|active| active.shared.cancel.load(Ordering::Relaxed) && active.machine.is_active())
            .unwrap_or(false);

        if cancelled {
            let now = self.now();
            let actions = self.active.as_mut().unwrap().machine.cancel(now);
            self.run_actions(actions, None)?;
        }

        self.drain_raw()?;
        self.drain_udp()?;

        let now = self.now();
        if let Some(active) = self.active.as_mut() {
            let actions = active.machine.handle_timeout(now);
            self.run_actions(actions, None)?;
        }

        self.rearm_timer()
    }

    fn drain_raw(&mut self) -> Result<(), Error> {
        loop {
            let Some(raw_socket) = &self.raw else {
                break;
            };

            let mut buf = std::mem::take(&mut self.recv_buf);
            let received = raw_socket.recv(&mut buf);

            match received {
                Ok(Some((len, state))) => {
                    let result = self.process_raw_frame(&buf[..len], state);
                    self.recv_buf = buf;
                    result?;
                }
                Ok(None) => {
                    self.recv_buf = buf;
                    break;
                }
                Err(err) => {
                    self.recv_buf = buf;
                    return Err(Error::Io(err));
                }
            }
        }

        Ok(())
    }

    fn drain_udp(&mut self) -> Result<(), Error> {
        loop {
            let Some(udp_socket) = &self.udp else {
                break;
            };

            let mut buf = std::mem::take(&mut self.recv_buf);
            let received = udp_socket.recv(&mut buf);

            match received {
                Ok(Some(len)) => {
                    let result = self.process_payload(&buf[..len]);
                    self.recv_buf = buf;
                    result?;
                }
                Ok(None) => {
                    self.recv_buf = buf;
                    break;
                }
                Err(err) => {
                    self.recv_buf = buf;
                    return Err(Error::Io(err));
                }
            }
        }

        Ok(())
    }

    fn process_raw_frame(&mut self, frame: &[u8], state: ChecksumState) -> Result<(), Error> {
        let Some(active) = &self.active else {
            return Ok(());
        };

        let xid = active.machine.xid();
        let required_dst = self
            .config
            .strict_destination
            .then(|| active.machine.target())
            .flatten();

        // The kernel filter already vetted this, but locally injected and
        // simulated traffic goes through the same normative predicate
        if !dhcplink_raw::filter::admits(frame, xid, CLIENT_PORT, required_dst) {
            trace!("Frame not admitted, dropping");
            return Ok(());
        }

        let verify = state == ChecksumState::Unverified;

        let payload = match dhcplink_raw::decode_frame(frame, CLIENT_PORT, verify) {
            Ok(Some((_, _, payload))) => payload,
            Ok(None) => return Ok(()),
            Err(err) => {
                debug!("Dropping frame: {}", err);
                return Ok(());
            }
        };

        self.process_payload(payload)
    }

    fn process_payload(&mut self, data: &[u8]) -> Result<(), Error> {
        let packet = match Packet::decode(data) {
            Ok(packet) => packet,
            Err(err) => {
                debug!("Dropping malformed DHCP message: {}", err);
                return Ok(());
            }
        };

        let now = self.now();

        let Some(active) = self.active.as_mut() else {
            return Ok(());
        };

        let actions = active.machine.handle_packet(&packet, now);
        self.run_actions(actions, Some(&packet))
    }

    fn run_actions(&mut self, actions: Actions, packet: Option<&Packet>) -> Result<(), Error> {
        for action in actions {
            match action {
                Action::OpenRaw => self.open_raw()?,
                Action::CloseRaw => self.close_raw(),
                Action::OpenUdp { local, server } => self.open_udp(local, server),
                Action::CloseUdp => self.close_udp(),
                Action::Send { kind, dest } => self.send_message(kind, dest)?,
                Action::Emit(event) => self.emit(event, packet),
            }
        }

        Ok(())
    }

    fn open_raw(&mut self) -> Result<(), Error> {
        self.close_raw();

        let xid = self
            .active
            .as_ref()
            .map(|active| active.machine.xid())
            .unwrap_or_default();

        let socket = RawSocket::open(self.ident.ifindex, xid).map_err(Error::Io)?;
        self.poll
            .register(socket.as_raw_fd(), TOKEN_RAW)
            .map_err(Error::Io)?;
        self.raw = Some(socket);

        Ok(())
    }

    fn close_raw(&mut self) {
        if let Some(socket) = self.raw.take() {
            let _ = self.poll.deregister(socket.as_raw_fd());
        }
    }

    /// Opening the bound-mode socket can fail while the host has not yet
    /// installed the leased address; renewal then simply waits for the
    /// broadcast fallback at T2
    fn open_udp(&mut self, local: Ipv4Addr, server: Ipv4Addr) {
        self.close_udp();

        match UdpSocket::open(self.ident.ifindex, local, server) {
            Ok(socket) => match self.poll.register(socket.as_raw_fd(), TOKEN_UDP) {
                Ok(()) => self.udp = Some(socket),
                Err(err) => warn!("Bound-mode socket registration failed: {}", err),
            },
            Err(err) => warn!("Bound-mode socket unavailable: {}, waiting for rebind", err),
        }
    }

    fn close_udp(&mut self) {
        if let Some(socket) = self.udp.take() {
            let _ = self.poll.deregister(socket.as_raw_fd());
        }
    }

    fn send_message(&mut self, kind: MessageKind, dest: SendDest) -> Result<(), Error> {
        let Some(active) = &self.active else {
            return Ok(());
        };

        let now = Instant::from_millis(self.clock.now_millis());
        let max = self.config.max_message_size() as usize;

        let mut opt_buf = Options::buf();
        let message = active.machine.build_message(kind, &mut opt_buf, now);

        let sent = match dest {
            SendDest::Broadcast => {
                let Some(raw_socket) = &self.raw else {
                    warn!("No raw socket for a broadcast send, skipping");
                    return Ok(());
                };

                let frame = match dhcplink_raw::encode_frame(
                    &mut self.frame_buf,
                    SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, CLIENT_PORT),
                    SocketAddrV4::new(Ipv4Addr::BROADCAST, SERVER_PORT),
                    |payload| {
                        message
                            .encode(payload, max)
                            .map(|data| data.len())
                            .map_err(|_| dhcplink_raw::Error::BufferOverflow)
                    },
                ) {
                    Ok(frame) => frame,
                    Err(err) => {
                        debug_assert!(false, "outbound message does not fit: {}", err);
                        warn!("Outbound message does not fit the MTU, skipping send");
                        return Ok(());
                    }
                };

                raw_socket.send(frame, &self.ident.broadcast_addr)
            }
            SendDest::Server => {
                let Some(udp_socket) = &self.udp else {
                    warn!("No bound-mode socket for a unicast send, skipping");
                    return Ok(());
                };

                let data = match message.encode(&mut self.frame_buf, max) {
                    Ok(data) => data,
                    Err(err) => {
                        debug_assert!(false, "outbound message does not fit: {}", err);
                        warn!("Outbound message does not fit the MTU, skipping send");
                        return Ok(());
                    }
                };

                udp_socket.send(data)
            }
        };

        match sent {
            Ok(()) => Ok(()),
            Err(err) if is_transient(&err) => {
                // The retransmission timer will try again
                debug!("Send deferred: {}", err);
                Ok(())
            }
            Err(err) => Err(Error::Io(err)),
        }
    }

    fn emit(&mut self, event: ProbeEvent, packet: Option<&Packet>) {
        let millis = self.clock.now_millis();

        let event = match event {
            // Lease-carrying events are produced only while handling an
            // inbound reply, so the granting packet is always in hand
            ProbeEvent::Offer(info) | ProbeEvent::Granted(info) | ProbeEvent::Extended(info) => {
                let Some(packet) = packet else {
                    unreachable!("lease event without the reply that produced it");
                };

                let lease = Arc::new(Lease::from_reply(info, packet, millis));

                match event {
                    ProbeEvent::Offer(_) => Event::Offer(lease),
                    ProbeEvent::Granted(_) => Event::Granted(lease),
                    _ => Event::Extended(lease),
                }
            }
            ProbeEvent::Retracted => Event::Retracted,
            ProbeEvent::Expired => Event::Expired,
            ProbeEvent::Cancelled => Event::Cancelled,
        };

        self.events.push(event);
    }

    fn rearm_timer(&mut self) -> Result<(), Error> {
        let deadline = self
            .active
            .as_ref()
            .and_then(|active| active.machine.next_deadline());

        match deadline {
            Some(deadline) => {
                let now = self.now();
                let delay = if deadline > now {
                    deadline - now
                } else {
                    embassy_time::Duration::from_ticks(0)
                };

                self.timer
                    .arm(std::time::Duration::from_micros(delay.as_micros()))
                    .map_err(Error::Io)
            }
            None => self.timer.disarm().map_err(Error::Io),
        }
    }

    fn teardown(&mut self) {
        self.close_raw();
        self.close_udp();
        let _ = self.timer.disarm();
    }

    fn now(&self) -> Instant {
        Instant::from_millis(self.clock.now_millis())
    }
}

fn buffer_len(mtu: u16) -> usize {
    (mtu as usize).max(1536)
}

fn _assert_send() {
    fn assert_send<T: Send>() {}

    assert_send::<Client>();
}

#[cfg(test)]
mod tests {
    use super::*;

    const MAC: [u8; 6] = [0x02, 0, 0, 0, 0, 0x01];

    #[test]
    fn rejects_invalid_config() {
        assert!(matches!(
            Client::new(ClientConfig::new(0).with_ethernet(MAC)),
            Err(Error::InvalidConfig(_))
        ));

        assert!(matches!(
            Client::new(ClientConfig::new(2)),
            Err(Error::InvalidConfig(_))
        ));
    }

    #[test]
    fn idle_dispatch_is_inert() {
        let _ = env_logger::builder().is_test(true).try_init();

        let mut client = Client::new(ClientConfig::new(2).with_ethernet(MAC)).unwrap();

        assert!(client.fd() >= 0);
        assert!(client.pop_event().is_none());

        // Idempotent with nothing pending
        client.dispatch().unwrap();
        client.dispatch().unwrap();

        assert!(client.pop_event().is_none());
    }
}
