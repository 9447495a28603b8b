use core::net::Ipv4Addr;

use embassy_time::{Duration, Instant};

use log::{debug, info, trace, warn};

use rand_core::RngCore;

use crate::ident::{ClientIdent, TransportKind};
use crate::options::{DhcpOption, MessageType, Options};
use crate::packet::Packet;

/// RFC 2131 section 4.1: initial retransmission delay, doubled per retry
const INITIAL_DELAY: Duration = Duration::from_secs(4);
/// RFC 2131 section 4.1: retransmission delay ceiling
const MAX_DELAY_SECS: u64 = 64;
/// RFC 2131 suggests four REQUEST attempts before giving the address up
const REQUEST_ATTEMPTS: u32 = 4;
/// Unanswered reboot confirmations before falling back to discovery
const REBOOT_ATTEMPTS: u32 = 2;
/// Floor for the RENEWING/REBINDING retransmission interval
const RENEW_FLOOR: Duration = Duration::from_secs(60);
/// Nonsensical lease durations are clamped to one week
const LEASE_CLAMP_SECS: u32 = 7 * 24 * 3600;

const MAX_OFFERS: usize = 8;

/// The probe lifecycle per RFC 2131, figure 5
#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub enum ProbeState {
    Init,
    Selecting,
    Requesting,
    Rebooting,
    Informing,
    Bound,
    Renewing,
    Rebinding,
    Cancelled,
}

impl core::fmt::Display for ProbeState {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        let str = match self {
            Self::Init => "INIT",
            Self::Selecting => "SELECTING",
            Self::Requesting => "REQUESTING",
            Self::Rebooting => "REBOOTING",
            Self::Informing => "INFORMING",
            Self::Bound => "BOUND",
            Self::Renewing => "RENEWING",
            Self::Rebinding => "REBINDING",
            Self::Cancelled => "CANCELLED",
        };

        write!(f, "{}", str)
    }
}

/// The fixed-field summary of a server reply the state machine works with.
///
/// The full option stream of the winning reply, unknown options included,
/// is available to the caller from the packet the summary was taken from.
#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub struct LeaseInfo {
    pub yiaddr: Ipv4Addr,
    pub server_id: Ipv4Addr,
    pub subnet_mask: Option<Ipv4Addr>,
    pub router: Option<Ipv4Addr>,
    /// Absent for INFORM-acquired configuration, which carries no lifetimes
    pub times: Option<LeaseTimes>,
}

#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub struct LeaseTimes {
    pub lease: Duration,
    pub t1: Duration,
    pub t2: Duration,
}

impl LeaseInfo {
    /// Reads an OFFER or ACK that assigns an address.
    ///
    /// Replies missing the server identifier or the lease time, or carrying
    /// an address that cannot be valid, are malformed per the protocol and
    /// yield `None`; the caller drops them without a state change.
    pub fn from_address_reply(packet: &Packet, allow_link_local: bool) -> Option<Self> {
        let server_id = packet.options.server_identifier()?;
        if server_id.is_unspecified() {
            return None;
        }

        let subnet_mask = packet.options.subnet_mask();

        if !sane_address(packet.yiaddr, subnet_mask, allow_link_local) {
            debug!(
                "Reply assigns unusable address {}, dropping",
                packet.yiaddr
            );
            return None;
        }

        let times = lease_times(&packet.options)?;

        Some(Self {
            yiaddr: packet.yiaddr,
            server_id,
            subnet_mask,
            router: packet.options.router(),
            times: Some(times),
        })
    }

    /// Reads an ACK answering an INFORM; `addr` is the externally configured
    /// address the configuration is for
    pub fn from_inform_reply(packet: &Packet, addr: Ipv4Addr) -> Option<Self> {
        let server_id = packet.options.server_identifier()?;
        if server_id.is_unspecified() {
            return None;
        }

        Some(Self {
            yiaddr: addr,
            server_id,
            subnet_mask: packet.options.subnet_mask(),
            router: packet.options.router(),
            times: None,
        })
    }
}

fn sane_address(yiaddr: Ipv4Addr, mask: Option<Ipv4Addr>, allow_link_local: bool) -> bool {
    if yiaddr.is_unspecified() || yiaddr.is_broadcast() {
        return false;
    }

    if let Some(mask) = mask {
        let mask = u32::from(mask);
        if mask != 0 && u32::from(yiaddr) == (u32::from(yiaddr) & mask) | !mask {
            return false;
        }
    }

    if !allow_link_local && yiaddr.is_link_local() {
        return false;
    }

    true
}

fn lease_times(options: &Options) -> Option<LeaseTimes> {
    let mut lease = options.lease_time()?;

    if lease == 0 || lease > i32::MAX as u32 {
        warn!("Nonsensical lease time {}s, clamping to one week", lease);
        lease = LEASE_CLAMP_SECS;
    }

    let t1 = match options.renewal_time() {
        Some(secs) if secs > 0 => secs,
        _ => lease / 2,
    };

    let t2 = match options.rebinding_time() {
        Some(secs) if secs > 0 => secs,
        _ => lease - lease / 8,
    };

    // 0 < T1 <= T2 <= lease
    let t2 = t2.min(lease);
    let t1 = t1.min(t2).max(1);

    Some(LeaseTimes {
        lease: Duration::from_secs(lease as u64),
        t1: Duration::from_secs(t1 as u64),
        t2: Duration::from_secs(t2 as u64),
    })
}

/// Knobs of one acquisition attempt
#[derive(Clone, Debug)]
pub struct ProbeOptions {
    /// INIT-REBOOT: confirm this previously held address instead of
    /// discovering
    pub requested_ip: Option<Ipv4Addr>,
    /// INFORM: only fetch configuration for this externally assigned address
    pub inform_address: Option<Ipv4Addr>,
    /// Select the first well-formed OFFER instead of collecting
    pub accept_first_offer: bool,
    /// How long offers are collected after the first one arrives
    pub offer_window: Duration,
    /// Ask servers to broadcast their replies (the BROADCAST flag); forced
    /// on for Infiniband
    pub request_broadcast: bool,
    /// Accept 169.254/16 assignments
    pub allow_link_local: bool,
    /// Maximum DHCP message size we announce and honor when encoding
    pub max_message_size: u16,
    /// Parameter request list (option 55) payload
    pub parameter_request_list: heapless::Vec<u8, 32>,
}

impl Default for ProbeOptions {
    fn default() -> Self {
        let mut parameter_request_list = heapless::Vec::new();
        let _ = parameter_request_list.extend_from_slice(&[1, 3, 6, 15, 51, 54, 58, 59]);

        Self {
            requested_ip: None,
            inform_address: None,
            accept_first_offer: false,
            offer_window: Duration::from_secs(3),
            request_broadcast: true,
            allow_link_local: false,
            max_message_size: 576,
            parameter_request_list,
        }
    }
}

/// What the caller is asked to do after feeding the state machine.
///
/// Actions are ordered; socket directives precede the sends that need them.
#[derive(Clone, PartialEq, Eq, Debug)]
pub enum Action {
    /// Open the link-layer socket, filtered on the probe's xid
    OpenRaw,
    CloseRaw,
    /// Open the bound-mode UDP socket: `local`:68 connected to `server`:67
    OpenUdp { local: Ipv4Addr, server: Ipv4Addr },
    CloseUdp,
    /// Build the named message via [`Probe::build_message`] and send it once;
    /// retransmission stays timer-driven
    Send { kind: MessageKind, dest: SendDest },
    Emit(ProbeEvent),
}

#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub enum MessageKind {
    Discover,
    Request,
    Decline,
    Release,
    Inform,
}

#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub enum SendDest {
    /// Limited broadcast through the raw path
    Broadcast,
    /// The lease's server through the bound-mode UDP path
    Server,
}

#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub enum ProbeEvent {
    Offer(LeaseInfo),
    Granted(LeaseInfo),
    Extended(LeaseInfo),
    Retracted,
    Expired,
    Cancelled,
}

pub type Actions = heapless::Vec<Action, 16>;

fn act(actions: &mut Actions, action: Action) {
    let overflow = actions.push(action).is_err();
    debug_assert!(!overflow, "action buffer overflow");
}

/// One end-to-end acquisition attempt.
///
/// The probe is a pure reducer: it owns no sockets and reads no clocks. The
/// caller feeds it decoded packets and the current instant, executes the
/// returned [`Action`]s, and keeps a single timer armed at
/// [`Probe::next_deadline`]. Within one dispatch round, packets must be fed
/// before [`Probe::handle_timeout`] so that a reply beats a concurrently
/// expired retransmission timer.
pub struct Probe<R> {
    ident: ClientIdent,
    opts: ProbeOptions,
    rng: R,
    state: ProbeState,
    xid: u32,
    started: Instant,
    retry: u32,
    offers: heapless::Vec<LeaseInfo, MAX_OFFERS>,
    collecting: bool,
    chosen: Option<LeaseInfo>,
    accepted: bool,
    resend: Option<Instant>,
    offer_deadline: Option<Instant>,
    renew_at: Option<Instant>,
    rebind_at: Option<Instant>,
    expire_at: Option<Instant>,
}

impl<R> Probe<R>
where
    R: RngCore,
{
    pub fn new(ident: ClientIdent, opts: ProbeOptions, mut rng: R) -> Self {
        let xid = rng.next_u32();

        Self {
            ident,
            opts,
            rng,
            state: ProbeState::Init,
            xid,
            started: Instant::from_ticks(0),
            retry: 0,
            offers: heapless::Vec::new(),
            collecting: false,
            chosen: None,
            accepted: false,
            resend: None,
            offer_deadline: None,
            renew_at: None,
            rebind_at: None,
            expire_at: None,
        }
    }

    pub fn xid(&self) -> u32 {
        self.xid
    }

    pub fn state(&self) -> ProbeState {
        self.state
    }

    pub fn is_active(&self) -> bool {
        !matches!(self.state, ProbeState::Init | ProbeState::Cancelled)
    }

    /// The address the chosen server is expected to assign or extend, from
    /// REQUESTING onward
    pub fn target(&self) -> Option<Ipv4Addr> {
        self.chosen.map(|info| info.yiaddr)
    }

    /// The lease currently held, while one is
    pub fn lease(&self) -> Option<LeaseInfo> {
        matches!(
            self.state,
            ProbeState::Bound | ProbeState::Renewing | ProbeState::Rebinding
        )
        .then_some(self.chosen)
        .flatten()
    }

    pub fn next_deadline(&self) -> Option<Instant> {
        let mut min = None;

        for deadline in [
            self.resend,
            self.offer_deadline,
            self.renew_at,
            self.rebind_at,
            self.expire_at,
        ]
        .into_iter()
        .flatten()
        {
            if min.map(|min| deadline < min).unwrap_or(true) {
                min = Some(deadline);
            }
        }

        min
    }

    pub fn set_max_message_size(&mut self, size: u16) {
        self.opts.max_message_size = size;
    }

    pub fn start(&mut self, now: Instant) -> Actions {
        debug_assert_eq!(self.state, ProbeState::Init);

        let mut actions = Actions::new();

        self.started = now;
        self.retry = 0;
        self.chosen = None;
        self.accepted = false;
        self.collecting = true;

        act(&mut actions, Action::OpenRaw);

        let kind = if self.opts.inform_address.is_some() {
            self.state = ProbeState::Informing;
            MessageKind::Inform
        } else if self.opts.requested_ip.is_some() {
            self.state = ProbeState::Rebooting;
            MessageKind::Request
        } else {
            self.state = ProbeState::Selecting;
            MessageKind::Discover
        };

        act(
            &mut actions,
            Action::Send {
                kind,
                dest: SendDest::Broadcast,
            },
        );

        self.resend = Some(now + self.jittered(self.backoff()));

        debug!("Probe {:08x}: started, {}", self.xid, self.state);

        actions
    }

    /// Feeds one decoded, transport-vetted reply to the machine
    pub fn handle_packet(&mut self, packet: &Packet, now: Instant) -> Actions {
        let mut actions = Actions::new();

        if !packet.reply || packet.xid != self.xid || !self.ident.matches_chaddr(packet) {
            trace!("Reply not addressed to this probe, dropping");
            return actions;
        }

        let Some(mt) = packet.options.message_type() else {
            trace!("Reply without a message type, dropping");
            return actions;
        };

        match (self.state, mt) {
            (ProbeState::Selecting, MessageType::Offer) => self.offer(packet, now, &mut actions),
            (ProbeState::Requesting | ProbeState::Rebooting, MessageType::Ack) => {
                self.granted(packet, now, &mut actions)
            }
            (ProbeState::Requesting | ProbeState::Rebooting, MessageType::Nak) => {
                self.retracted(packet, Action::CloseRaw, &mut actions)
            }
            (ProbeState::Renewing | ProbeState::Rebinding, MessageType::Ack) => {
                self.extended(packet, now, &mut actions)
            }
            (ProbeState::Renewing, MessageType::Nak) => {
                self.retracted(packet, Action::CloseUdp, &mut actions)
            }
            (ProbeState::Rebinding, MessageType::Nak) => {
                self.retracted(packet, Action::CloseRaw, &mut actions)
            }
            (ProbeState::Informing, MessageType::Ack) => {
                self.inform_granted(packet, &mut actions)
            }
            (state, mt) => debug!("Probe {:08x}: ignoring {} in {}", self.xid, mt, state),
        }

        actions
    }

    /// Fires every deadline that is due; a no-op when none is
    pub fn handle_timeout(&mut self, now: Instant) -> Actions {
        let mut actions = Actions::new();

        loop {
            if due(self.offer_deadline, now) {
                self.offer_deadline = None;
                self.collecting = false;
                debug!(
                    "Probe {:08x}: offer window closed with {} offer(s) buffered",
                    self.xid,
                    self.offers.len()
                );
            } else if due(self.resend, now) {
                self.retransmit(now, &mut actions);
            } else if due(self.renew_at, now) {
                self.renew(now, &mut actions);
            } else if due(self.rebind_at, now) {
                self.rebind(now, &mut actions);
            } else if due(self.expire_at, now) {
                self.expire(&mut actions);
            } else {
                break;
            }
        }

        actions
    }

    /// Promotes a buffered offer; the argument must match one of the offers
    /// announced via [`ProbeEvent::Offer`]
    pub fn select(&mut self, offer: &LeaseInfo, now: Instant) -> Actions {
        let mut actions = Actions::new();

        if self.state != ProbeState::Selecting {
            warn!("Probe {:08x}: select() outside SELECTING, ignoring", self.xid);
            return actions;
        }

        let Some(info) = self
            .offers
            .iter()
            .find(|buffered| {
                buffered.server_id == offer.server_id && buffered.yiaddr == offer.yiaddr
            })
            .copied()
        else {
            warn!(
                "Probe {:08x}: selected lease is not among the buffered offers",
                self.xid
            );
            return actions;
        };

        self.begin_request(info, now, &mut actions);

        actions
    }

    /// Confirms a granted lease; the host considers itself configured
    pub fn accept(&mut self) {
        if self.state == ProbeState::Bound {
            self.accepted = true;
        } else {
            warn!("Probe {:08x}: accept() outside BOUND, ignoring", self.xid);
        }
    }

    /// Whether the host confirmed the granted lease via [`Probe::accept`]
    pub fn is_accepted(&self) -> bool {
        self.accepted
    }

    /// Rejects a granted address (e.g. on ARP collision) with a DHCPDECLINE
    pub fn decline(&mut self, _now: Instant) -> Actions {
        let mut actions = Actions::new();

        if self.state != ProbeState::Bound {
            warn!("Probe {:08x}: decline() outside BOUND, ignoring", self.xid);
            return actions;
        }

        info!(
            "Probe {:08x}: declining {}",
            self.xid,
            self.chosen.map(|info| info.yiaddr).unwrap_or(Ipv4Addr::UNSPECIFIED)
        );

        act(&mut actions, Action::OpenRaw);
        act(
            &mut actions,
            Action::Send {
                kind: MessageKind::Decline,
                dest: SendDest::Broadcast,
            },
        );
        act(&mut actions, Action::CloseRaw);

        self.reset_to_init();

        actions
    }

    /// Returns the lease to the server and goes back to INIT. Fire and
    /// forget per RFC 2131; no event is emitted.
    pub fn release(&mut self, _now: Instant) -> Actions {
        let mut actions = Actions::new();

        let Some(info) = self.lease() else {
            warn!("Probe {:08x}: release() without a lease, ignoring", self.xid);
            return actions;
        };

        info!("Probe {:08x}: releasing {}", self.xid, info.yiaddr);

        match self.state {
            ProbeState::Renewing => {
                // The bound-mode socket is already open
                act(
                    &mut actions,
                    Action::Send {
                        kind: MessageKind::Release,
                        dest: SendDest::Server,
                    },
                );
                act(&mut actions, Action::CloseUdp);
            }
            ProbeState::Rebinding => {
                act(&mut actions, Action::CloseRaw);
                act(
                    &mut actions,
                    Action::OpenUdp {
                        local: info.yiaddr,
                        server: info.server_id,
                    },
                );
                act(
                    &mut actions,
                    Action::Send {
                        kind: MessageKind::Release,
                        dest: SendDest::Server,
                    },
                );
                act(&mut actions, Action::CloseUdp);
            }
            _ => {
                act(
                    &mut actions,
                    Action::OpenUdp {
                        local: info.yiaddr,
                        server: info.server_id,
                    },
                );
                act(
                    &mut actions,
                    Action::Send {
                        kind: MessageKind::Release,
                        dest: SendDest::Server,
                    },
                );
                act(&mut actions, Action::CloseUdp);
            }
        }

        self.reset_to_init();

        actions
    }

    /// Cancels the probe and releases its sockets
    pub fn cancel(&mut self, _now: Instant) -> Actions {
        let mut actions = Actions::new();

        if !self.is_active() {
            return actions;
        }

        match self.state {
            ProbeState::Selecting
            | ProbeState::Requesting
            | ProbeState::Rebooting
            | ProbeState::Informing
            | ProbeState::Rebinding => act(&mut actions, Action::CloseRaw),
            ProbeState::Renewing => act(&mut actions, Action::CloseUdp),
            _ => (),
        }

        self.reset_to_init();
        self.state = ProbeState::Cancelled;

        act(&mut actions, Action::Emit(ProbeEvent::Cancelled));

        debug!("Probe {:08x}: cancelled", self.xid);

        actions
    }

    /// Builds the outgoing message a [`Action::Send`] asked for
    pub fn build_message<'o>(
        &'o self,
        kind: MessageKind,
        opt_buf: &'o mut [DhcpOption<'o>],
        now: Instant,
    ) -> Packet<'o> {
        let secs = self.secs(now);
        let max_size = self.opts.max_message_size;
        let params = &self.opts.parameter_request_list;
        let client_id = &self.ident.client_id;
        let chosen = self.chosen;

        let (options, ciaddr, broadcast) = match kind {
            MessageKind::Discover => (
                Options::discover(self.opts.requested_ip, max_size, params, client_id, opt_buf),
                Ipv4Addr::UNSPECIFIED,
                self.broadcast_flag(),
            ),
            MessageKind::Request => match self.state {
                ProbeState::Renewing | ProbeState::Rebinding | ProbeState::Bound => (
                    // Lease extension: ciaddr set, no server id, no
                    // requested address (RFC 2131 section 4.3.2)
                    Options::request(None, None, max_size, params, client_id, opt_buf),
                    chosen.map(|info| info.yiaddr).unwrap_or(Ipv4Addr::UNSPECIFIED),
                    self.state != ProbeState::Renewing && self.broadcast_flag(),
                ),
                ProbeState::Rebooting => (
                    Options::request(
                        None,
                        self.opts.requested_ip,
                        max_size,
                        params,
                        client_id,
                        opt_buf,
                    ),
                    Ipv4Addr::UNSPECIFIED,
                    self.broadcast_flag(),
                ),
                _ => (
                    Options::request(
                        chosen.map(|info| info.server_id),
                        chosen.map(|info| info.yiaddr),
                        max_size,
                        params,
                        client_id,
                        opt_buf,
                    ),
                    Ipv4Addr::UNSPECIFIED,
                    self.broadcast_flag(),
                ),
            },
            MessageKind::Decline => (
                Options::decline(
                    chosen.map(|info| info.server_id).unwrap_or(Ipv4Addr::UNSPECIFIED),
                    chosen.map(|info| info.yiaddr).unwrap_or(Ipv4Addr::UNSPECIFIED),
                    client_id,
                    opt_buf,
                ),
                Ipv4Addr::UNSPECIFIED,
                self.broadcast_flag(),
            ),
            MessageKind::Release => (
                Options::release(
                    chosen.map(|info| info.server_id).unwrap_or(Ipv4Addr::UNSPECIFIED),
                    client_id,
                    opt_buf,
                ),
                chosen.map(|info| info.yiaddr).unwrap_or(Ipv4Addr::UNSPECIFIED),
                false,
            ),
            MessageKind::Inform => (
                Options::inform(max_size, params, client_id, opt_buf),
                self.opts.inform_address.unwrap_or(Ipv4Addr::UNSPECIFIED),
                self.broadcast_flag(),
            ),
        };

        Packet::new_request(
            self.ident.transport.htype(),
            self.ident.transport.hlen(),
            self.ident.chaddr(),
            self.xid,
            secs,
            broadcast,
            ciaddr,
            options,
        )
    }

    fn offer(&mut self, packet: &Packet, now: Instant, actions: &mut Actions) {
        if !self.collecting {
            trace!("Probe {:08x}: offer window closed, dropping OFFER", self.xid);
            return;
        }

        let Some(info) = LeaseInfo::from_address_reply(packet, self.opts.allow_link_local) else {
            debug!("Probe {:08x}: dropping malformed OFFER", self.xid);
            return;
        };

        if self
            .offers
            .iter()
            .any(|offer| offer.server_id == info.server_id && offer.yiaddr == info.yiaddr)
        {
            return;
        }

        info!(
            "Probe {:08x}: {} offered by server {}",
            self.xid, info.yiaddr, info.server_id
        );

        if self.opts.accept_first_offer {
            self.begin_request(info, now, actions);
            return;
        }

        if self.offers.is_empty() {
            self.offer_deadline = Some(now + self.opts.offer_window);
            // Servers answered; stop re-broadcasting DISCOVER while the
            // host picks
            self.resend = None;
        }

        if self.offers.push(info).is_err() {
            warn!("Probe {:08x}: offer buffer full, dropping OFFER", self.xid);
            return;
        }

        act(actions, Action::Emit(ProbeEvent::Offer(info)));
    }

    fn begin_request(&mut self, info: LeaseInfo, now: Instant, actions: &mut Actions) {
        self.chosen = Some(info);
        self.offers.clear();
        self.offer_deadline = None;
        self.state = ProbeState::Requesting;
        self.retry = 0;
        self.resend = Some(now + self.jittered(self.backoff()));

        act(
            actions,
            Action::Send {
                kind: MessageKind::Request,
                dest: SendDest::Broadcast,
            },
        );

        info!(
            "Probe {:08x}: requesting {} from server {}",
            self.xid, info.yiaddr, info.server_id
        );
    }

    fn granted(&mut self, packet: &Packet, now: Instant, actions: &mut Actions) {
        let Some(info) = LeaseInfo::from_address_reply(packet, self.opts.allow_link_local) else {
            debug!("Probe {:08x}: dropping malformed ACK", self.xid);
            return;
        };

        self.bind(info, now);

        act(actions, Action::CloseRaw);
        act(actions, Action::Emit(ProbeEvent::Granted(info)));

        info!(
            "Probe {:08x}: {} granted by server {}",
            self.xid, info.yiaddr, info.server_id
        );
    }

    fn extended(&mut self, packet: &Packet, now: Instant, actions: &mut Actions) {
        let Some(info) = LeaseInfo::from_address_reply(packet, self.opts.allow_link_local) else {
            debug!("Probe {:08x}: dropping malformed ACK", self.xid);
            return;
        };

        let close = if self.state == ProbeState::Renewing {
            Action::CloseUdp
        } else {
            Action::CloseRaw
        };

        self.bind(info, now);

        act(actions, close);
        act(actions, Action::Emit(ProbeEvent::Extended(info)));

        info!(
            "Probe {:08x}: lease on {} extended by server {}",
            self.xid, info.yiaddr, info.server_id
        );
    }

    fn bind(&mut self, info: LeaseInfo, now: Instant) {
        // from_address_reply guarantees the lifetimes
        let times = info.times.unwrap_or(LeaseTimes {
            lease: Duration::from_secs(LEASE_CLAMP_SECS as u64),
            t1: Duration::from_secs(LEASE_CLAMP_SECS as u64 / 2),
            t2: Duration::from_secs(LEASE_CLAMP_SECS as u64 * 7 / 8),
        });

        self.chosen = Some(info);
        self.state = ProbeState::Bound;
        self.retry = 0;
        self.resend = None;
        self.renew_at = Some(now + times.t1);
        self.rebind_at = Some(now + times.t2);
        self.expire_at = Some(now + times.lease);
    }

    fn inform_granted(&mut self, packet: &Packet, actions: &mut Actions) {
        let addr = self.opts.inform_address.unwrap_or(Ipv4Addr::UNSPECIFIED);

        let Some(info) = LeaseInfo::from_inform_reply(packet, addr) else {
            debug!("Probe {:08x}: dropping malformed ACK", self.xid);
            return;
        };

        self.chosen = Some(info);
        self.state = ProbeState::Bound;
        self.retry = 0;
        self.resend = None;

        act(actions, Action::CloseRaw);
        act(actions, Action::Emit(ProbeEvent::Granted(info)));

        info!(
            "Probe {:08x}: configuration for {} supplied by server {}",
            self.xid, info.yiaddr, info.server_id
        );
    }

    fn retracted(&mut self, packet: &Packet, close: Action, actions: &mut Actions) {
        let message = packet.options.iter().find_map(|option| {
            if let DhcpOption::Message(message) = option {
                Some(message)
            } else {
                None
            }
        });

        info!(
            "Probe {:08x}: server refused the address: {}",
            self.xid,
            message.unwrap_or("(no reason given)")
        );

        self.reset_to_init();

        act(actions, close);
        act(actions, Action::Emit(ProbeEvent::Retracted));
    }

    fn retransmit(&mut self, now: Instant, actions: &mut Actions) {
        match self.state {
            ProbeState::Selecting | ProbeState::Informing => {
                self.retry += 1;
                self.resend = Some(now + self.jittered(self.backoff()));

                let kind = if self.state == ProbeState::Informing {
                    MessageKind::Inform
                } else {
                    MessageKind::Discover
                };

                act(
                    actions,
                    Action::Send {
                        kind,
                        dest: SendDest::Broadcast,
                    },
                );

                debug!("Probe {:08x}: retransmit #{} in {}", self.xid, self.retry, self.state);
            }
            ProbeState::Requesting => {
                self.retry += 1;

                if self.retry >= REQUEST_ATTEMPTS {
                    info!(
                        "Probe {:08x}: no ACK after {} requests, giving up",
                        self.xid, self.retry
                    );

                    self.reset_to_init();

                    act(actions, Action::CloseRaw);
                    act(actions, Action::Emit(ProbeEvent::Retracted));
                } else {
                    self.resend = Some(now + self.jittered(self.backoff()));

                    act(
                        actions,
                        Action::Send {
                            kind: MessageKind::Request,
                            dest: SendDest::Broadcast,
                        },
                    );
                }
            }
            ProbeState::Rebooting => {
                self.retry += 1;

                if self.retry >= REBOOT_ATTEMPTS {
                    info!(
                        "Probe {:08x}: reboot confirmation unanswered, falling back to discovery",
                        self.xid
                    );

                    self.state = ProbeState::Selecting;
                    self.retry = 0;
                    self.resend = Some(now + self.jittered(self.backoff()));

                    act(
                        actions,
                        Action::Send {
                            kind: MessageKind::Discover,
                            dest: SendDest::Broadcast,
                        },
                    );
                } else {
                    self.resend = Some(now + self.jittered(self.backoff()));

                    act(
                        actions,
                        Action::Send {
                            kind: MessageKind::Request,
                            dest: SendDest::Broadcast,
                        },
                    );
                }
            }
            ProbeState::Renewing => {
                self.resend = Some(now + self.renew_interval(now, self.rebind_at));

                act(
                    actions,
                    Action::Send {
                        kind: MessageKind::Request,
                        dest: SendDest::Server,
                    },
                );
            }
            ProbeState::Rebinding => {
                self.resend = Some(now + self.renew_interval(now, self.expire_at));

                act(
                    actions,
                    Action::Send {
                        kind: MessageKind::Request,
                        dest: SendDest::Broadcast,
                    },
                );
            }
            _ => self.resend = None,
        }
    }

    fn renew(&mut self, now: Instant, actions: &mut Actions) {
        self.renew_at = None;

        let Some(info) = self.chosen else {
            return;
        };

        if !self.accepted {
            debug!(
                "Probe {:08x}: renewing a lease the host never accepted",
                self.xid
            );
        }

        self.state = ProbeState::Renewing;
        self.resend = Some(now + self.renew_interval(now, self.rebind_at));

        act(
            actions,
            Action::OpenUdp {
                local: info.yiaddr,
                server: info.server_id,
            },
        );
        act(
            actions,
            Action::Send {
                kind: MessageKind::Request,
                dest: SendDest::Server,
            },
        );

        info!(
            "Probe {:08x}: T1 elapsed, renewing {} with server {}",
            self.xid, info.yiaddr, info.server_id
        );
    }

    fn rebind(&mut self, now: Instant, actions: &mut Actions) {
        self.rebind_at = None;

        if self.state == ProbeState::Renewing {
            act(actions, Action::CloseUdp);
        }

        self.state = ProbeState::Rebinding;
        self.resend = Some(now + self.renew_interval(now, self.expire_at));

        act(actions, Action::OpenRaw);
        act(
            actions,
            Action::Send {
                kind: MessageKind::Request,
                dest: SendDest::Broadcast,
            },
        );

        info!("Probe {:08x}: T2 elapsed, rebinding", self.xid);
    }

    fn expire(&mut self, actions: &mut Actions) {
        let close = match self.state {
            ProbeState::Renewing => Some(Action::CloseUdp),
            ProbeState::Rebinding => Some(Action::CloseRaw),
            _ => None,
        };

        info!("Probe {:08x}: lease expired", self.xid);

        self.reset_to_init();

        if let Some(close) = close {
            act(actions, close);
        }

        act(actions, Action::Emit(ProbeEvent::Expired));
    }

    fn reset_to_init(&mut self) {
        self.state = ProbeState::Init;
        self.retry = 0;
        self.offers.clear();
        self.collecting = false;
        self.accepted = false;
        self.resend = None;
        self.offer_deadline = None;
        self.renew_at = None;
        self.rebind_at = None;
        self.expire_at = None;
    }

    fn secs(&self, now: Instant) -> u16 {
        let elapsed = if now >= self.started {
            now - self.started
        } else {
            Duration::from_ticks(0)
        };

        elapsed.as_secs().min(u16::MAX as u64) as u16
    }

    fn broadcast_flag(&self) -> bool {
        matches!(self.ident.transport, TransportKind::Infiniband) || self.opts.request_broadcast
    }

    fn backoff(&self) -> Duration {
        let secs = (INITIAL_DELAY.as_secs() << self.retry.min(4)).min(MAX_DELAY_SECS);

        Duration::from_secs(secs)
    }

    /// RFC 2131 section 4.1: each delay is randomized by +-1 second
    fn jittered(&mut self, base: Duration) -> Duration {
        let jitter = (self.rng.next_u32() % 2001) as i64 - 1000;
        let millis = (base.as_millis() as i64 + jitter).max(0);

        Duration::from_millis(millis as u64)
    }

    fn renew_interval(&self, now: Instant, until: Option<Instant>) -> Duration {
        let remaining = until
            .filter(|until| *until > now)
            .map(|until| until - now)
            .unwrap_or(Duration::from_ticks(0));

        let half = remaining / 2;

        if half < RENEW_FLOOR {
            RENEW_FLOOR
        } else {
            half
        }
    }
}

fn due(deadline: Option<Instant>, now: Instant) -> bool {
    deadline.map(|deadline| deadline <= now).unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ident::HardwareAddr;

    const MAC: [u8; 6] = [0x02, 0, 0, 0, 0, 0x01];
    const SERVER: Ipv4Addr = Ipv4Addr::new(10, 0, 0, 1);
    const OFFERED: Ipv4Addr = Ipv4Addr::new(10, 0, 0, 42);
    const MASK: Ipv4Addr = Ipv4Addr::new(255, 255, 255, 0);

    struct TestRng(u32);

    impl RngCore for TestRng {
        fn next_u32(&mut self) -> u32 {
            self.0 = self.0.wrapping_mul(1664525).wrapping_add(1013904223);
            self.0
        }

        fn next_u64(&mut self) -> u64 {
            (self.next_u32() as u64) << 32 | self.next_u32() as u64
        }

        fn fill_bytes(&mut self, dest: &mut [u8]) {
            for byte in dest {
                *byte = self.next_u32() as u8;
            }
        }

        fn try_fill_bytes(&mut self, dest: &mut [u8]) -> Result<(), rand_core::Error> {
            self.fill_bytes(dest);
            Ok(())
        }
    }

    fn ident() -> ClientIdent {
        ClientIdent {
            ifindex: 2,
            transport: TransportKind::Ethernet,
            addr: HardwareAddr::from_slice(&MAC).unwrap(),
            broadcast_addr: HardwareAddr::BROADCAST_ETHERNET,
            client_id: heapless::Vec::new(),
        }
    }

    fn probe(opts: ProbeOptions) -> Probe<TestRng> {
        Probe::new(ident(), opts, TestRng(7))
    }

    fn at(secs: u64) -> Instant {
        Instant::from_secs(secs)
    }

    fn reply<'a>(mt_options: &'a [DhcpOption<'a>], xid: u32, yiaddr: Ipv4Addr) -> Packet<'a> {
        let mut chaddr = [0; 16];
        chaddr[..6].copy_from_slice(&MAC);

        Packet {
            reply: true,
            htype: 1,
            hlen: 6,
            hops: 0,
            xid,
            secs: 0,
            broadcast: false,
            ciaddr: Ipv4Addr::UNSPECIFIED,
            yiaddr,
            siaddr: Ipv4Addr::UNSPECIFIED,
            giaddr: Ipv4Addr::UNSPECIFIED,
            chaddr,
            sname: &[],
            file: &[],
            options: Options::new(mt_options),
        }
    }

    fn offer_options<'a>(lease: u32) -> [DhcpOption<'a>; 6] {
        [
            DhcpOption::MessageType(MessageType::Offer),
            DhcpOption::ServerIdentifier(SERVER),
            DhcpOption::SubnetMask(MASK),
            DhcpOption::IpAddressLeaseTime(lease),
            DhcpOption::RenewalTime(1800),
            DhcpOption::RebindingTime(3150),
        ]
    }

    fn ack_options<'a>(server: Ipv4Addr, lease: u32) -> [DhcpOption<'a>; 4] {
        [
            DhcpOption::MessageType(MessageType::Ack),
            DhcpOption::ServerIdentifier(server),
            DhcpOption::SubnetMask(MASK),
            DhcpOption::IpAddressLeaseTime(lease),
        ]
    }

    fn sends(actions: &Actions) -> std::vec::Vec<(MessageKind, SendDest)> {
        actions
            .iter()
            .filter_map(|action| {
                if let Action::Send { kind, dest } = action {
                    Some((*kind, *dest))
                } else {
                    None
                }
            })
            .collect()
    }

    fn events(actions: &Actions) -> std::vec::Vec<ProbeEvent> {
        actions
            .iter()
            .filter_map(|action| {
                if let Action::Emit(event) = action {
                    Some(*event)
                } else {
                    None
                }
            })
            .collect()
    }

    /// Runs the probe to BOUND; returns the bind instant
    fn bind(probe: &mut Probe<TestRng>) -> Instant {
        probe.start(at(0));

        let xid = probe.xid();
        let __offer_opts = offer_options(3600);
        let offer = reply(&__offer_opts, xid, OFFERED);
        let actions = probe.handle_packet(&offer, at(1));
        let info = match events(&actions)[..] {
            [ProbeEvent::Offer(info)] => info,
            _ => panic!("expected a single OFFER event"),
        };

        probe.select(&info, at(1));

        let __ack_opts = ack_options(SERVER, 3600);
        let ack = reply(&__ack_opts, xid, OFFERED);
        let actions = probe.handle_packet(&ack, at(2));
        assert!(matches!(events(&actions)[..], [ProbeEvent::Granted(_)]));
        assert_eq!(probe.state(), ProbeState::Bound);

        at(2)
    }

    #[test]
    fn happy_path() {
        let mut probe = probe(ProbeOptions::default());

        let actions = probe.start(at(0));
        assert_eq!(actions[0], Action::OpenRaw);
        assert_eq!(sends(&actions), [(MessageKind::Discover, SendDest::Broadcast)]);
        assert_eq!(probe.state(), ProbeState::Selecting);

        let xid = probe.xid();

        let __offer_opts = offer_options(3600);
        let offer = reply(&__offer_opts, xid, OFFERED);
        let actions = probe.handle_packet(&offer, at(1));

        let info = match events(&actions)[..] {
            [ProbeEvent::Offer(info)] => info,
            _ => panic!("expected a single OFFER event"),
        };
        assert_eq!(info.yiaddr, OFFERED);
        assert_eq!(info.server_id, SERVER);
        assert_eq!(
            info.times,
            Some(LeaseTimes {
                lease: Duration::from_secs(3600),
                t1: Duration::from_secs(1800),
                t2: Duration::from_secs(3150),
            })
        );

        let actions = probe.select(&info, at(1));
        assert_eq!(sends(&actions), [(MessageKind::Request, SendDest::Broadcast)]);
        assert_eq!(probe.state(), ProbeState::Requesting);

        // The REQUEST names the server and the offered address
        let mut opt_buf = Options::buf();
        let request = probe.build_message(MessageKind::Request, &mut opt_buf, at(1));
        assert_eq!(request.xid, xid);
        assert_eq!(request.options.server_identifier(), Some(SERVER));
        assert!(request
            .options
            .iter()
            .any(|option| option == DhcpOption::RequestedIpAddress(OFFERED)));

        let __ack_opts = ack_options(SERVER, 3600);
        let ack = reply(&__ack_opts, xid, OFFERED);
        let actions = probe.handle_packet(&ack, at(2));

        let granted = match events(&actions)[..] {
            [ProbeEvent::Granted(info)] => info,
            _ => panic!("expected a single GRANTED event"),
        };
        assert_eq!(granted.yiaddr, OFFERED);
        assert_eq!(granted.times.unwrap().lease, Duration::from_secs(3600));
        assert_eq!(probe.state(), ProbeState::Bound);

        // T1 before T2 before expiry
        assert_eq!(probe.next_deadline(), Some(at(2 + 1800)));
    }

    #[test]
    fn outbound_messages_share_the_probe_xid() {
        let mut probe = probe(ProbeOptions::default());
        let bound_at = bind(&mut probe);
        let xid = probe.xid();

        for kind in [
            MessageKind::Discover,
            MessageKind::Request,
            MessageKind::Decline,
            MessageKind::Release,
        ] {
            let mut opt_buf = Options::buf();
            assert_eq!(probe.build_message(kind, &mut opt_buf, bound_at).xid, xid);
        }
    }

    #[test]
    fn nak_retracts_without_a_lease() {
        let mut probe = probe(ProbeOptions::default());
        probe.start(at(0));
        let xid = probe.xid();

        let __offer_opts = offer_options(3600);
        let offer = reply(&__offer_opts, xid, OFFERED);
        let actions = probe.handle_packet(&offer, at(1));
        let info = match events(&actions)[..] {
            [ProbeEvent::Offer(info)] => info,
            _ => panic!(),
        };
        probe.select(&info, at(1));

        let nak_options = [
            DhcpOption::MessageType(MessageType::Nak),
            DhcpOption::ServerIdentifier(SERVER),
            DhcpOption::Message("lease expired"),
        ];
        let nak = reply(&nak_options, xid, Ipv4Addr::UNSPECIFIED);
        let actions = probe.handle_packet(&nak, at(2));

        assert_eq!(events(&actions), [ProbeEvent::Retracted]);
        assert!(actions.contains(&Action::CloseRaw));
        assert_eq!(probe.state(), ProbeState::Init);
        assert_eq!(probe.lease(), None);
    }

    #[test]
    fn lost_ack_rebinds_and_extends() {
        let mut probe = probe(ProbeOptions::default());
        let bound_at = bind(&mut probe);
        let xid = probe.xid();

        // T1: unicast renewal through the bound-mode socket
        let t1 = bound_at + Duration::from_secs(1800);
        let actions = probe.handle_timeout(t1);
        assert_eq!(
            actions[0],
            Action::OpenUdp {
                local: OFFERED,
                server: SERVER,
            }
        );
        assert_eq!(sends(&actions), [(MessageKind::Request, SendDest::Server)]);
        assert_eq!(probe.state(), ProbeState::Renewing);

        // Renewal retransmissions at max(60, remaining/2) never reach past T2
        let resend = probe.next_deadline().unwrap();
        assert!(resend > t1 + Duration::from_secs(60));

        // No ACK by T2: back to broadcast through the raw path
        let t2 = bound_at + Duration::from_secs(3150);
        probe.handle_timeout(resend);
        let actions = probe.handle_timeout(t2);
        assert!(actions.contains(&Action::CloseUdp));
        assert!(actions.contains(&Action::OpenRaw));
        assert!(sends(&actions).contains(&(MessageKind::Request, SendDest::Broadcast)));
        assert_eq!(probe.state(), ProbeState::Rebinding);

        // A different server extends the same address
        let second = Ipv4Addr::new(10, 0, 0, 2);
        let __ack_opts = ack_options(second, 7200);
        let ack = reply(&__ack_opts, xid, OFFERED);
        let actions = probe.handle_packet(&ack, t2 + Duration::from_secs(1));

        let extended = match events(&actions)[..] {
            [ProbeEvent::Extended(info)] => info,
            _ => panic!("expected exactly one EXTENDED event"),
        };
        assert_eq!(extended.yiaddr, OFFERED);
        assert_eq!(extended.server_id, second);
        assert_eq!(extended.times.unwrap().lease, Duration::from_secs(7200));
        assert_eq!(probe.state(), ProbeState::Bound);
    }

    #[test]
    fn unrenewed_lease_expires_to_init() {
        let mut probe = probe(ProbeOptions::default());
        let bound_at = bind(&mut probe);

        let mut now = bound_at;
        let expiry = bound_at + Duration::from_secs(3600);
        let mut expired = std::vec::Vec::new();

        while let Some(deadline) = probe.next_deadline() {
            now = deadline.max(now);
            expired.extend(events(&probe.handle_timeout(now)));
        }

        assert!(now >= expiry);
        assert_eq!(expired, [ProbeEvent::Expired]);
        assert_eq!(probe.state(), ProbeState::Init);
        assert_eq!(probe.lease(), None);

        // Silent until the host restarts the probe
        assert!(probe.handle_timeout(now + Duration::from_secs(3600)).is_empty());
    }

    #[test]
    fn foreign_xid_changes_nothing() {
        let mut probe = probe(ProbeOptions::default());
        probe.start(at(0));
        let xid = probe.xid();

        let deadline = probe.next_deadline();

        let __offer_opts = offer_options(3600);
        let offer = reply(&__offer_opts, xid ^ 1, OFFERED);
        let actions = probe.handle_packet(&offer, at(1));

        assert!(actions.is_empty());
        assert_eq!(probe.state(), ProbeState::Selecting);
        assert_eq!(probe.next_deadline(), deadline);
    }

    #[test]
    fn decline_returns_to_init() {
        let mut probe = probe(ProbeOptions::default());
        let bound_at = bind(&mut probe);

        let actions = probe.decline(bound_at);
        assert_eq!(
            &actions[..],
            &[
                Action::OpenRaw,
                Action::Send {
                    kind: MessageKind::Decline,
                    dest: SendDest::Broadcast,
                },
                Action::CloseRaw,
            ]
        );

        // The DECLINE names the server and the rejected address
        let mut opt_buf = Options::buf();
        let decline = probe.build_message(MessageKind::Decline, &mut opt_buf, bound_at);
        assert_eq!(decline.options.server_identifier(), Some(SERVER));
        assert!(decline
            .options
            .iter()
            .any(|option| option == DhcpOption::RequestedIpAddress(OFFERED)));

        assert_eq!(probe.state(), ProbeState::Init);
        assert_eq!(probe.lease(), None);
    }

    #[test]
    fn discover_backoff_doubles_with_bounded_jitter() {
        let mut probe = probe(ProbeOptions::default());
        probe.start(at(0));

        let first = probe.next_deadline().unwrap();
        assert!(first >= at(3) && first <= at(5));

        let actions = probe.handle_timeout(first);
        assert_eq!(sends(&actions), [(MessageKind::Discover, SendDest::Broadcast)]);

        let second = probe.next_deadline().unwrap();
        let delay = second - first;
        assert!(delay >= Duration::from_secs(7) && delay <= Duration::from_secs(9));
    }

    #[test]
    fn request_gives_up_after_four_attempts() {
        let mut probe = probe(ProbeOptions::default());
        probe.start(at(0));
        let xid = probe.xid();

        let __offer_opts = offer_options(3600);
        let offer = reply(&__offer_opts, xid, OFFERED);
        let actions = probe.handle_packet(&offer, at(1));
        let info = match events(&actions)[..] {
            [ProbeEvent::Offer(info)] => info,
            _ => panic!(),
        };
        probe.select(&info, at(1));

        let mut retracted = std::vec::Vec::new();
        for _ in 0..REQUEST_ATTEMPTS {
            let deadline = probe.next_deadline().unwrap();
            retracted.extend(events(&probe.handle_timeout(deadline)));
        }

        assert_eq!(retracted, [ProbeEvent::Retracted]);
        assert_eq!(probe.state(), ProbeState::Init);
    }

    #[test]
    fn first_offer_policy_requests_immediately() {
        let mut probe = probe(ProbeOptions {
            accept_first_offer: true,
            ..Default::default()
        });
        probe.start(at(0));
        let xid = probe.xid();

        let __offer_opts = offer_options(3600);
        let offer = reply(&__offer_opts, xid, OFFERED);
        let actions = probe.handle_packet(&offer, at(1));

        assert!(events(&actions).is_empty());
        assert_eq!(sends(&actions), [(MessageKind::Request, SendDest::Broadcast)]);
        assert_eq!(probe.state(), ProbeState::Requesting);
    }

    #[test]
    fn offers_stop_buffering_once_the_window_closes() {
        let mut probe = probe(ProbeOptions::default());
        probe.start(at(0));
        let xid = probe.xid();

        let __offer_opts = offer_options(3600);
        let offer = reply(&__offer_opts, xid, OFFERED);
        let actions = probe.handle_packet(&offer, at(1));
        assert_eq!(events(&actions).len(), 1);

        // Window closes 3s after the first offer
        assert_eq!(probe.next_deadline(), Some(at(4)));
        probe.handle_timeout(at(4));

        let late_options = [
            DhcpOption::MessageType(MessageType::Offer),
            DhcpOption::ServerIdentifier(Ipv4Addr::new(10, 0, 0, 7)),
            DhcpOption::IpAddressLeaseTime(3600),
        ];
        let late = reply(&late_options, xid, Ipv4Addr::new(10, 0, 0, 99));
        let actions = probe.handle_packet(&late, at(5));
        assert!(actions.is_empty());

        // The buffered offer is still selectable
        let offer_info = LeaseInfo {
            yiaddr: OFFERED,
            server_id: SERVER,
            subnet_mask: Some(MASK),
            router: None,
            times: None,
        };
        let actions = probe.select(&offer_info, at(5));
        assert_eq!(sends(&actions), [(MessageKind::Request, SendDest::Broadcast)]);
    }

    #[test]
    fn init_reboot_falls_back_to_discovery() {
        let mut probe = probe(ProbeOptions {
            requested_ip: Some(OFFERED),
            ..Default::default()
        });

        let actions = probe.start(at(0));
        assert_eq!(sends(&actions), [(MessageKind::Request, SendDest::Broadcast)]);
        assert_eq!(probe.state(), ProbeState::Rebooting);

        let mut opt_buf = Options::buf();
        let request = probe.build_message(MessageKind::Request, &mut opt_buf, at(0));
        assert_eq!(request.options.server_identifier(), None);
        assert!(request
            .options
            .iter()
            .any(|option| option == DhcpOption::RequestedIpAddress(OFFERED)));

        // Two unanswered confirmations, then DISCOVER
        let deadline = probe.next_deadline().unwrap();
        let actions = probe.handle_timeout(deadline);
        assert_eq!(sends(&actions), [(MessageKind::Request, SendDest::Broadcast)]);
        assert_eq!(probe.state(), ProbeState::Rebooting);

        let deadline = probe.next_deadline().unwrap();
        let actions = probe.handle_timeout(deadline);
        assert_eq!(sends(&actions), [(MessageKind::Discover, SendDest::Broadcast)]);
        assert_eq!(probe.state(), ProbeState::Selecting);
    }

    #[test]
    fn renewal_request_is_a_plain_ciaddr_extension() {
        let mut probe = probe(ProbeOptions::default());
        let bound_at = bind(&mut probe);

        probe.handle_timeout(bound_at + Duration::from_secs(1800));
        assert_eq!(probe.state(), ProbeState::Renewing);

        let mut opt_buf = Options::buf();
        let request = probe.build_message(
            MessageKind::Request,
            &mut opt_buf,
            bound_at + Duration::from_secs(1800),
        );

        assert_eq!(request.ciaddr, OFFERED);
        assert_eq!(request.options.server_identifier(), None);
        assert!(!request
            .options
            .iter()
            .any(|option| matches!(option, DhcpOption::RequestedIpAddress(_))));
        assert!(!request.broadcast);
    }

    #[test]
    fn cancel_emits_and_releases_sockets() {
        let mut probe = probe(ProbeOptions::default());
        probe.start(at(0));

        let actions = probe.cancel(at(1));
        assert_eq!(
            &actions[..],
            &[Action::CloseRaw, Action::Emit(ProbeEvent::Cancelled)]
        );
        assert_eq!(probe.state(), ProbeState::Cancelled);
        assert!(!probe.is_active());

        // Cancelling twice is inert
        assert!(probe.cancel(at(2)).is_empty());
    }

    #[test]
    fn release_uses_the_bound_path_and_stays_silent() {
        let mut probe = probe(ProbeOptions::default());
        let bound_at = bind(&mut probe);

        let actions = probe.release(bound_at + Duration::from_secs(5));
        assert_eq!(
            &actions[..],
            &[
                Action::OpenUdp {
                    local: OFFERED,
                    server: SERVER,
                },
                Action::Send {
                    kind: MessageKind::Release,
                    dest: SendDest::Server,
                },
                Action::CloseUdp,
            ]
        );
        assert!(events(&actions).is_empty());
        assert_eq!(probe.state(), ProbeState::Init);
    }

    #[test]
    fn inform_grants_configuration_without_lifetimes() {
        let addr = Ipv4Addr::new(10, 0, 0, 5);
        let mut probe = probe(ProbeOptions {
            inform_address: Some(addr),
            ..Default::default()
        });

        let actions = probe.start(at(0));
        assert_eq!(sends(&actions), [(MessageKind::Inform, SendDest::Broadcast)]);

        let mut opt_buf = Options::buf();
        let inform = probe.build_message(MessageKind::Inform, &mut opt_buf, at(0));
        assert_eq!(inform.ciaddr, addr);

        let ack_options = [
            DhcpOption::MessageType(MessageType::Ack),
            DhcpOption::ServerIdentifier(SERVER),
            DhcpOption::SubnetMask(MASK),
        ];
        let ack = reply(&ack_options, probe.xid(), Ipv4Addr::UNSPECIFIED);
        let actions = probe.handle_packet(&ack, at(1));

        let granted = match events(&actions)[..] {
            [ProbeEvent::Granted(info)] => info,
            _ => panic!("expected a single GRANTED event"),
        };
        assert_eq!(granted.yiaddr, addr);
        assert_eq!(granted.times, None);
        assert_eq!(probe.state(), ProbeState::Bound);
        assert_eq!(probe.next_deadline(), None);
    }

    #[test]
    fn lease_times_are_clamped_and_ordered() {
        let ack_options = [
            DhcpOption::MessageType(MessageType::Ack),
            DhcpOption::ServerIdentifier(SERVER),
            DhcpOption::IpAddressLeaseTime(0),
        ];
        let ack = reply(&ack_options, 1, OFFERED);

        let info = LeaseInfo::from_address_reply(&ack, false).unwrap();
        let times = info.times.unwrap();

        assert_eq!(times.lease, Duration::from_secs(7 * 24 * 3600));
        assert!(times.t1 <= times.t2 && times.t2 <= times.lease);
        assert!(times.t1 > Duration::from_ticks(0));

        // T2 above the lease duration is pulled back under it
        let ack_options = [
            DhcpOption::MessageType(MessageType::Ack),
            DhcpOption::ServerIdentifier(SERVER),
            DhcpOption::IpAddressLeaseTime(1000),
            DhcpOption::RenewalTime(999),
            DhcpOption::RebindingTime(5000),
        ];
        let ack = reply(&ack_options, 1, OFFERED);
        let times = LeaseInfo::from_address_reply(&ack, false).unwrap().times.unwrap();
        assert_eq!(times.t2, Duration::from_secs(1000));
        assert_eq!(times.t1, Duration::from_secs(999));
    }

    #[test]
    fn ack_missing_required_options_is_ignored() {
        let mut probe = probe(ProbeOptions::default());
        probe.start(at(0));
        let xid = probe.xid();

        let __offer_opts = offer_options(3600);
        let offer = reply(&__offer_opts, xid, OFFERED);
        let actions = probe.handle_packet(&offer, at(1));
        let info = match events(&actions)[..] {
            [ProbeEvent::Offer(info)] => info,
            _ => panic!(),
        };
        probe.select(&info, at(1));

        // No lease time
        let bad_options = [
            DhcpOption::MessageType(MessageType::Ack),
            DhcpOption::ServerIdentifier(SERVER),
        ];
        let bad = reply(&bad_options, xid, OFFERED);
        assert!(probe.handle_packet(&bad, at(2)).is_empty());
        assert_eq!(probe.state(), ProbeState::Requesting);

        // Subnet broadcast address
        let __bad_opts = ack_options(SERVER, 3600);
        let bad = reply(&__bad_opts, xid, Ipv4Addr::new(10, 0, 0, 255));
        assert!(probe.handle_packet(&bad, at(2)).is_empty());
        assert_eq!(probe.state(), ProbeState::Requesting);
    }
}
