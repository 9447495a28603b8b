use std::collections::VecDeque;
use std::sync::Arc;

use log::warn;

use crate::lease::Lease;

/// Notifications delivered to the host, in production order, via
/// [`crate::Client::pop_event`]
#[derive(Clone, Debug)]
pub enum Event {
    /// The client hit a fatal error or shed events under overload; the host
    /// should resync its view of the client (and recreate it if dispatch
    /// starts failing)
    Down,
    /// A server offered a lease; promote it with [`crate::Client::select`]
    Offer(Arc<Lease>),
    /// The selected lease was acknowledged; confirm with
    /// [`crate::Client::accept`] or reject with [`crate::Client::decline`]
    Granted(Arc<Lease>),
    /// The server refused or revoked the address; the probe is back in INIT
    Retracted,
    /// A renewal or rebind succeeded; the event carries the fresh lease
    Extended(Arc<Lease>),
    /// The lease ran out without a successful extension; drop the address
    Expired,
    Cancelled,
}

impl Event {
    pub fn lease(&self) -> Option<&Arc<Lease>> {
        match self {
            Self::Offer(lease) | Self::Granted(lease) | Self::Extended(lease) => Some(lease),
            _ => None,
        }
    }

    /// Terminal events end the probe's story and are never shed
    fn is_terminal(&self) -> bool {
        matches!(self, Self::Expired | Self::Cancelled)
    }
}

/// Bounded FIFO between the dispatch path and the host.
///
/// Overflow sheds the oldest non-terminal event and leaves a `Down` marker
/// at the front so the host knows to resync; the relative order of the
/// surviving events is untouched.
pub(crate) struct EventQueue {
    events: VecDeque<Event>,
    capacity: usize,
}

impl EventQueue {
    pub fn new(capacity: usize) -> Self {
        Self {
            events: VecDeque::with_capacity(capacity),
            capacity: capacity.max(2),
        }
    }

    pub fn push(&mut self, event: Event) {
        if self.events.len() >= self.capacity {
            warn!("Event queue overflow, shedding the oldest event");

            if let Some(pos) = self.events.iter().position(|queued| !queued.is_terminal()) {
                self.events.remove(pos);

                if !matches!(self.events.front(), Some(Event::Down)) {
                    // The resync marker takes another shed slot, keeping the
                    // queue within bounds
                    if let Some(pos) =
                        self.events.iter().position(|queued| !queued.is_terminal())
                    {
                        self.events.remove(pos);
                    }

                    self.events.push_front(Event::Down);
                }
            }
        }

        self.events.push_back(event);
    }

    pub fn pop(&mut self) -> Option<Event> {
        self.events.pop_front()
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn offer(n: u8) -> Event {
        Event::Offer(Arc::new(Lease::for_tests(n)))
    }

    fn offered(event: &Event) -> u8 {
        match event {
            Event::Offer(lease) => lease.address().octets()[3],
            _ => panic!("not an offer"),
        }
    }

    #[test]
    fn fifo_order() {
        let mut queue = EventQueue::new(8);

        queue.push(offer(1));
        queue.push(Event::Retracted);
        queue.push(offer(2));

        assert_eq!(offered(&queue.pop().unwrap()), 1);
        assert!(matches!(queue.pop(), Some(Event::Retracted)));
        assert_eq!(offered(&queue.pop().unwrap()), 2);
        assert!(queue.pop().is_none());
    }

    #[test]
    fn overflow_sheds_oldest_and_marks_down() {
        let mut queue = EventQueue::new(4);

        for n in 1..=4 {
            queue.push(offer(n));
        }
        queue.push(offer(5));

        // Front is the resync marker; survivors keep their relative order
        assert!(matches!(queue.pop(), Some(Event::Down)));

        let mut survivors = Vec::new();
        while let Some(event) = queue.pop() {
            survivors.push(offered(&event));
        }

        assert_eq!(survivors, [3, 4, 5]);
    }

    #[test]
    fn terminal_events_survive_overflow() {
        let mut queue = EventQueue::new(4);

        queue.push(Event::Expired);
        queue.push(Event::Cancelled);
        for n in 1..=2 {
            queue.push(offer(n));
        }
        queue.push(offer(3));

        let mut terminals = 0;
        while let Some(event) = queue.pop() {
            if event.is_terminal() {
                terminals += 1;
            }
        }

        assert_eq!(terminals, 2);
    }
}
