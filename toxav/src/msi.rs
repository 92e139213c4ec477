//
// Copyright 2025 Signal Messenger, LLC
// SPDX-License-Identifier: AGPL-3.0-only
//

//! Call signaling: the lifecycle of one-to-one calls and the negotiation of
//! what media each side sends and receives.
//!
//! A call is started by an `Init` request, answered or updated with `Push`,
//! and ended by `Pop` (which may carry an error). Messages travel over the
//! lossless channel, so they arrive in order and exactly once.
//!
//! Lifecycle events are reported to handlers registered per [`CallEvent`].
//! Handlers are invoked while the session lock is held, but may call back into
//! the [`Msi`] (for example to hang up the call being reported).

mod message;

use std::{cell::RefCell, collections::HashMap, sync::Arc};

use anyhow::{anyhow, Context};
use log::*;
use parking_lot::ReentrantMutex;
use strum_macros::{Display, EnumIter};
use thiserror::Error;

pub use self::message::{
    Capabilities, ErrorCode, Message, ParseError, Request, MAX_MESSAGE_LEN, MSI_PACKET_ID,
};
use crate::transport::{FriendNumber, LosslessPacketSender, SendError};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Display, EnumIter)]
pub enum CallState {
    Inactive,
    /// We sent an invite.
    Requesting,
    /// We received an invite.
    Requested,
    Active,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Display, EnumIter)]
pub enum CallEvent {
    /// The peer invited us.
    Invite,
    /// The peer answered our invite.
    Start,
    /// The peer hung up.
    End,
    /// The peer ended the call with an error.
    Error,
    /// The peer went offline.
    PeerTimeout,
    /// The peer changed its capabilities.
    Capabilities,
}

impl CallEvent {
    // The call ends after these no matter what the handler returns.
    fn ignores_failure(self) -> bool {
        matches!(self, Self::End | Self::Error | Self::PeerTimeout)
    }
}

/// The state of a call with one friend, as handed to handlers.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Call {
    pub friend_number: FriendNumber,
    pub state: CallState,
    pub self_capabilities: Capabilities,
    pub peer_capabilities: Capabilities,
    pub error: ErrorCode,
}

impl Call {
    fn new(friend_number: FriendNumber) -> Self {
        Self {
            friend_number,
            state: CallState::Inactive,
            self_capabilities: Capabilities::empty(),
            peer_capabilities: Capabilities::empty(),
            error: ErrorCode::None,
        }
    }
}

pub type CallHandler = dyn Fn(&Msi, &Call) -> anyhow::Result<()> + Send + Sync;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum MsiError {
    #[error("already in a call with friend {0}")]
    AlreadyInCall(FriendNumber),
    #[error("no call with friend {0}")]
    NoCall(FriendNumber),
    #[error("call with friend {friend_number} is {state}")]
    InvalidState {
        friend_number: FriendNumber,
        state: CallState,
    },
    #[error(transparent)]
    Send(#[from] SendError),
}

#[derive(Default)]
struct CallTable {
    calls: HashMap<FriendNumber, Call>,
    handlers: HashMap<CallEvent, Arc<CallHandler>>,
}

/// The signaling session of one messenger instance.
pub struct Msi {
    table: ReentrantMutex<RefCell<CallTable>>,
    send_packet: Box<LosslessPacketSender>,
}

impl Msi {
    pub fn new(send_packet: Box<LosslessPacketSender>) -> Self {
        Self {
            table: ReentrantMutex::new(RefCell::new(CallTable::default())),
            send_packet,
        }
    }

    pub fn set_handler(
        &self,
        event: CallEvent,
        handler: impl Fn(&Msi, &Call) -> anyhow::Result<()> + Send + Sync + 'static,
    ) {
        let table = self.table.lock();
        table.borrow_mut().handlers.insert(event, Arc::new(handler));
    }

    pub fn call(&self, friend_number: FriendNumber) -> Option<Call> {
        let table = self.table.lock();
        let call = table.borrow().calls.get(&friend_number).cloned();
        call
    }

    pub fn calls(&self) -> Vec<Call> {
        let table = self.table.lock();
        let calls = table.borrow().calls.values().cloned().collect();
        calls
    }

    pub fn invite(
        &self,
        friend_number: FriendNumber,
        capabilities: Capabilities,
    ) -> Result<(), MsiError> {
        let table = self.table.lock();
        if table.borrow().calls.contains_key(&friend_number) {
            error!("msi({}): already in a call", friend_number);
            return Err(MsiError::AlreadyInCall(friend_number));
        }

        let mut call = Call::new(friend_number);
        call.self_capabilities = capabilities;
        call.state = CallState::Requesting;
        table.borrow_mut().calls.insert(friend_number, call);

        if let Err(err) = self.send(friend_number, &Message::new(Request::Init, capabilities)) {
            table.borrow_mut().calls.remove(&friend_number);
            return Err(err.into());
        }
        info!(
            "msi({}): inviting with capabilities {:?}",
            friend_number, capabilities
        );
        Ok(())
    }

    pub fn answer(
        &self,
        friend_number: FriendNumber,
        capabilities: Capabilities,
    ) -> Result<(), MsiError> {
        let table = self.table.lock();
        self.expect_state(&table, friend_number, |state| state == CallState::Requested)?;

        self.send(friend_number, &Message::new(Request::Push, capabilities))?;
        if let Some(call) = table.borrow_mut().calls.get_mut(&friend_number) {
            call.self_capabilities = capabilities;
            call.state = CallState::Active;
        }
        info!("msi({}): answered", friend_number);
        Ok(())
    }

    pub fn change_capabilities(
        &self,
        friend_number: FriendNumber,
        capabilities: Capabilities,
    ) -> Result<(), MsiError> {
        let table = self.table.lock();
        self.expect_state(&table, friend_number, |state| state == CallState::Active)?;

        if let Some(call) = table.borrow_mut().calls.get_mut(&friend_number) {
            call.self_capabilities = capabilities;
        }
        info!(
            "msi({}): changing capabilities to {:?}",
            friend_number, capabilities
        );
        self.send(friend_number, &Message::new(Request::Push, capabilities))?;
        Ok(())
    }

    /// Ends the call. The call is gone afterwards even if the peer couldn't be told.
    pub fn hangup(&self, friend_number: FriendNumber) -> Result<(), MsiError> {
        let table = self.table.lock();
        self.expect_state(&table, friend_number, |state| state != CallState::Inactive)?;

        let sent = self.send(friend_number, &Message::pop());
        table.borrow_mut().calls.remove(&friend_number);
        info!("msi({}): hung up", friend_number);
        sent.map_err(MsiError::from)
    }

    /// Ends all calls, without invoking any handlers.
    pub fn kill(&self) {
        let table = self.table.lock();
        let friend_numbers: Vec<FriendNumber> = table
            .borrow_mut()
            .calls
            .drain()
            .map(|(friend_number, _)| friend_number)
            .collect();
        for friend_number in friend_numbers {
            info!("msi({}): ending call on shutdown", friend_number);
            let _ = self.send(friend_number, &Message::pop());
        }
    }

    /// Informs us about the peer's connection status. A call with a peer that
    /// goes offline is ended.
    pub fn handle_peer_status(&self, friend_number: FriendNumber, connected: bool) {
        if connected {
            return;
        }
        let table = self.table.lock();
        let Some(call) = table.borrow_mut().calls.remove(&friend_number) else {
            return;
        };
        info!("msi({}): peer timed out", friend_number);
        let _ = self.run_handler(&table, CallEvent::PeerTimeout, &call);
    }

    /// Handles a packet from the lossless channel, including its packet id.
    pub fn handle_packet(&self, friend_number: FriendNumber, packet: &[u8]) {
        let table = self.table.lock();

        let message = match Message::parse_packet(packet) {
            Ok(message) => message,
            Err(err) => {
                warn!("msi({}): invalid message: {}", friend_number, err);
                warn!("{}", hex::encode(&packet[..packet.len().min(100)]));
                let _ = self.send(friend_number, &Message::error(ErrorCode::InvalidMessage));
                return;
            }
        };
        debug!("msi({}): received {:?}", friend_number, message);

        let exists = table.borrow().calls.contains_key(&friend_number);
        if !exists {
            match message.request {
                Request::Init => {
                    table
                        .borrow_mut()
                        .calls
                        .insert(friend_number, Call::new(friend_number));
                }
                Request::Pop => {
                    // Deliberate departure from the classic protocol, which answers a
                    // stray pop with an error. Answering would make two peers without
                    // a call trade errors forever.
                    info!("msi({}): ignoring stray pop", friend_number);
                    return;
                }
                Request::Push => {
                    warn!("msi({}): stray push", friend_number);
                    let _ = self.send(friend_number, &Message::error(ErrorCode::StrayMessage));
                    return;
                }
            }
        }

        match message.request {
            Request::Init => self.handle_init(&table, friend_number, &message),
            Request::Push => self.handle_push(&table, friend_number, &message),
            Request::Pop => self.handle_pop(&table, friend_number, &message),
        }
    }

    fn handle_init(
        &self,
        table: &RefCell<CallTable>,
        friend_number: FriendNumber,
        message: &Message,
    ) {
        let Some(capabilities) = message.capabilities else {
            warn!("msi({}): init without capabilities", friend_number);
            self.fail_call(table, friend_number, ErrorCode::InvalidMessage);
            return;
        };

        let Some(state) = self.state_of(table, friend_number) else {
            return;
        };
        match state {
            CallState::Inactive => {
                self.update_call(table, friend_number, |call| {
                    call.peer_capabilities = capabilities;
                    call.state = CallState::Requested;
                });
                info!(
                    "msi({}): invited with capabilities {:?}",
                    friend_number, capabilities
                );
                self.invoke_or_fail(table, CallEvent::Invite, friend_number);
            }
            CallState::Active => {
                info!("msi({}): peer is calling again", friend_number);
                if !self.set_peer_capabilities(table, friend_number, capabilities) {
                    return;
                }
                let Some(call) = self.call_of(table, friend_number) else {
                    return;
                };
                let _ = self.send(
                    friend_number,
                    &Message::new(Request::Push, call.self_capabilities),
                );
            }
            CallState::Requested | CallState::Requesting => {
                warn!("msi({}): init while {}", friend_number, state);
                self.fail_call(table, friend_number, ErrorCode::InvalidState);
            }
        }
    }

    fn handle_push(
        &self,
        table: &RefCell<CallTable>,
        friend_number: FriendNumber,
        message: &Message,
    ) {
        let Some(capabilities) = message.capabilities else {
            warn!("msi({}): push without capabilities", friend_number);
            self.fail_call(table, friend_number, ErrorCode::InvalidMessage);
            return;
        };

        let Some(state) = self.state_of(table, friend_number) else {
            return;
        };
        match state {
            CallState::Active => {
                self.set_peer_capabilities(table, friend_number, capabilities);
            }
            CallState::Requesting => {
                self.update_call(table, friend_number, |call| {
                    call.peer_capabilities = capabilities;
                    call.state = CallState::Active;
                });
                info!(
                    "msi({}): answered with capabilities {:?}",
                    friend_number, capabilities
                );
                self.invoke_or_fail(table, CallEvent::Start, friend_number);
            }
            CallState::Inactive | CallState::Requested => {
                warn!("msi({}): ignoring push while {}", friend_number, state);
            }
        }
    }

    fn handle_pop(
        &self,
        table: &RefCell<CallTable>,
        friend_number: FriendNumber,
        message: &Message,
    ) {
        // Gone before the handler runs, which may start a new call with the same friend.
        let Some(mut call) = table.borrow_mut().calls.remove(&friend_number) else {
            return;
        };
        let event = match message.error {
            Some(error) => {
                info!("msi({}): call ended with error {}", friend_number, error);
                call.error = error;
                CallEvent::Error
            }
            None => {
                info!("msi({}): peer hung up while {}", friend_number, call.state);
                CallEvent::End
            }
        };
        let _ = self.run_handler(table, event, &call);
    }

    /// Returns false if the call had to be ended.
    fn set_peer_capabilities(
        &self,
        table: &RefCell<CallTable>,
        friend_number: FriendNumber,
        capabilities: Capabilities,
    ) -> bool {
        let mut changed = false;
        self.update_call(table, friend_number, |call| {
            changed = call.peer_capabilities != capabilities;
            call.peer_capabilities = capabilities;
        });
        if !changed {
            return true;
        }
        info!(
            "msi({}): peer changed capabilities to {:?}",
            friend_number, capabilities
        );
        self.invoke_or_fail(table, CallEvent::Capabilities, friend_number)
    }

    /// Returns false if the call had to be ended.
    fn invoke_or_fail(
        &self,
        table: &RefCell<CallTable>,
        event: CallEvent,
        friend_number: FriendNumber,
    ) -> bool {
        match self.invoke_handler(table, event, friend_number) {
            Ok(()) => true,
            Err(err) => {
                warn!("msi({}): {:#}", friend_number, err);
                self.fail_call(table, friend_number, ErrorCode::Handle);
                false
            }
        }
    }

    // The table must not be borrowed while the handler runs, so it can call back into us.
    fn invoke_handler(
        &self,
        table: &RefCell<CallTable>,
        event: CallEvent,
        friend_number: FriendNumber,
    ) -> anyhow::Result<()> {
        let call = table.borrow().calls.get(&friend_number).cloned();
        let call = call.ok_or_else(|| anyhow!("call ended before {} event", event))?;
        self.run_handler(table, event, &call)
    }

    /// Runs the handler for `event` with a snapshot of the call, which may
    /// already be out of the table.
    fn run_handler(
        &self,
        table: &RefCell<CallTable>,
        event: CallEvent,
        call: &Call,
    ) -> anyhow::Result<()> {
        let handler = table.borrow().handlers.get(&event).cloned();
        let Some(handler) = handler else {
            if event.ignores_failure() {
                return Ok(());
            }
            return Err(anyhow!("no handler for {} event", event));
        };
        debug!("msi({}): invoking {} handler", call.friend_number, event);
        handler(self, call).with_context(|| format!("{} handler failed", event))
    }

    /// Tells the peer why the call is ending and ends it. An error already
    /// recorded on the call takes precedence over `error`.
    fn fail_call(
        &self,
        table: &RefCell<CallTable>,
        friend_number: FriendNumber,
        error: ErrorCode,
    ) {
        let Some(call) = table.borrow_mut().calls.remove(&friend_number) else {
            return;
        };
        let error = if call.error == ErrorCode::None {
            error
        } else {
            call.error
        };
        warn!("msi({}): ending call with error {}", friend_number, error);
        let _ = self.send(friend_number, &Message::error(error));
    }

    fn expect_state(
        &self,
        table: &RefCell<CallTable>,
        friend_number: FriendNumber,
        allowed: impl FnOnce(CallState) -> bool,
    ) -> Result<(), MsiError> {
        let Some(state) = self.state_of(table, friend_number) else {
            error!("msi({}): no call", friend_number);
            return Err(MsiError::NoCall(friend_number));
        };
        if !allowed(state) {
            error!("msi({}): call is in invalid state {}", friend_number, state);
            return Err(MsiError::InvalidState {
                friend_number,
                state,
            });
        }
        Ok(())
    }

    fn state_of(
        &self,
        table: &RefCell<CallTable>,
        friend_number: FriendNumber,
    ) -> Option<CallState> {
        table
            .borrow()
            .calls
            .get(&friend_number)
            .map(|call| call.state)
    }

    fn call_of(&self, table: &RefCell<CallTable>, friend_number: FriendNumber) -> Option<Call> {
        table.borrow().calls.get(&friend_number).cloned()
    }

    fn update_call(
        &self,
        table: &RefCell<CallTable>,
        friend_number: FriendNumber,
        update: impl FnOnce(&mut Call),
    ) {
        if let Some(call) = table.borrow_mut().calls.get_mut(&friend_number) {
            update(call);
        }
    }

    fn send(&self, friend_number: FriendNumber, message: &Message) -> Result<(), SendError> {
        debug!("msi({}): sending {:?}", friend_number, message);
        let result = (self.send_packet)(friend_number, &message.to_packet());
        if let Err(err) = &result {
            warn!("msi({}): {}", friend_number, err);
        }
        result
    }
}

impl Drop for Msi {
    fn drop(&mut self) {
        self.kill();
    }
}

#[cfg(test)]
mod test {
    use parking_lot::Mutex;

    use super::*;

    type Outbox = Arc<Mutex<Vec<(FriendNumber, Vec<u8>)>>>;
    type Events = Arc<Mutex<Vec<(CallEvent, Call)>>>;

    const AUDIO: Capabilities = Capabilities::from_bits(
        Capabilities::SEND_AUDIO.bits() | Capabilities::RECEIVE_AUDIO.bits(),
    );
    const AUDIO_VIDEO: Capabilities = Capabilities::from_bits(0b11_1100);

    fn new_msi() -> (Msi, Outbox) {
        let outbox: Outbox = Default::default();
        let captured = outbox.clone();
        let msi = Msi::new(Box::new(
            move |friend_number, packet: &[u8]| -> Result<(), SendError> {
                captured.lock().push((friend_number, packet.to_vec()));
                Ok(())
            },
        ));
        (msi, outbox)
    }

    /// Records every event and accepts it.
    fn record_events(msi: &Msi) -> Events {
        let events: Events = Default::default();
        for event in [
            CallEvent::Invite,
            CallEvent::Start,
            CallEvent::End,
            CallEvent::Error,
            CallEvent::PeerTimeout,
            CallEvent::Capabilities,
        ] {
            let events = events.clone();
            msi.set_handler(event, move |_msi, call| {
                events.lock().push((event, call.clone()));
                Ok(())
            });
        }
        events
    }

    fn take_sent(outbox: &Outbox) -> Vec<(FriendNumber, Message)> {
        outbox
            .lock()
            .drain(..)
            .map(|(friend_number, packet)| {
                (friend_number, Message::parse_packet(&packet).unwrap())
            })
            .collect()
    }

    /// Moves everything `from` sent to `to`, which knows the sender as `friend_number`.
    fn deliver(from: &Outbox, to: &Msi, friend_number: FriendNumber) {
        let packets: Vec<_> = from.lock().drain(..).collect();
        for (_, packet) in packets {
            to.handle_packet(friend_number, &packet);
        }
    }

    fn event_names(events: &Events) -> Vec<CallEvent> {
        events.lock().iter().map(|(event, _)| *event).collect()
    }

    /// Sets up an active call between a (friend 1 of b) and b (friend 0 of a).
    fn active_call() -> (Msi, Outbox, Events, Msi, Outbox, Events) {
        let (a, a_out) = new_msi();
        let (b, b_out) = new_msi();
        let a_events = record_events(&a);
        let b_events = record_events(&b);

        a.invite(0, AUDIO).unwrap();
        deliver(&a_out, &b, 1);
        b.answer(1, AUDIO).unwrap();
        deliver(&b_out, &a, 0);
        assert_eq!(CallState::Active, a.call(0).unwrap().state);
        assert_eq!(CallState::Active, b.call(1).unwrap().state);
        a_events.lock().clear();
        b_events.lock().clear();
        (a, a_out, a_events, b, b_out, b_events)
    }

    #[test]
    fn test_invite_answer() {
        let (a, a_out) = new_msi();
        let (b, b_out) = new_msi();
        let a_events = record_events(&a);
        let b_events = record_events(&b);

        a.invite(0, AUDIO).unwrap();
        assert_eq!(CallState::Requesting, a.call(0).unwrap().state);
        assert_eq!(
            vec![(0, Message::new(Request::Init, AUDIO))],
            take_sent(&a_out)
        );

        a.invite(0, AUDIO).unwrap_err();
        b.handle_packet(1, &Message::new(Request::Init, AUDIO_VIDEO).to_packet());
        let call = b.call(1).unwrap();
        assert_eq!(CallState::Requested, call.state);
        assert_eq!(AUDIO_VIDEO, call.peer_capabilities);
        assert_eq!(vec![CallEvent::Invite], event_names(&b_events));

        b.answer(1, AUDIO).unwrap();
        assert_eq!(CallState::Active, b.call(1).unwrap().state);
        deliver(&b_out, &a, 0);
        let call = a.call(0).unwrap();
        assert_eq!(CallState::Active, call.state);
        assert_eq!(AUDIO, call.peer_capabilities);
        assert_eq!(AUDIO, call.self_capabilities);
        assert_eq!(vec![CallEvent::Start], event_names(&a_events));
        assert_eq!(CallState::Active, a_events.lock()[0].1.state);
    }

    #[test]
    fn test_duplicate_invite() {
        let (a, a_out) = new_msi();
        a.invite(3, AUDIO).unwrap();
        assert_eq!(Err(MsiError::AlreadyInCall(3)), a.invite(3, AUDIO_VIDEO));
        assert_eq!(1, take_sent(&a_out).len());
        assert_eq!(AUDIO, a.call(3).unwrap().self_capabilities);
    }

    #[test]
    fn test_operations_in_wrong_state() {
        let (a, a_out) = new_msi();
        assert_eq!(Err(MsiError::NoCall(3)), a.answer(3, AUDIO));
        assert_eq!(Err(MsiError::NoCall(3)), a.hangup(3));
        assert_eq!(Err(MsiError::NoCall(3)), a.change_capabilities(3, AUDIO));

        a.invite(3, AUDIO).unwrap();
        take_sent(&a_out);
        assert_eq!(
            Err(MsiError::InvalidState {
                friend_number: 3,
                state: CallState::Requesting
            }),
            a.answer(3, AUDIO)
        );
        assert_eq!(
            Err(MsiError::InvalidState {
                friend_number: 3,
                state: CallState::Requesting
            }),
            a.change_capabilities(3, AUDIO_VIDEO)
        );
        assert!(take_sent(&a_out).is_empty());
        assert_eq!(CallState::Requesting, a.call(3).unwrap().state);
    }

    #[test]
    fn test_failed_invite_leaves_no_call() {
        let msi = Msi::new(Box::new(|friend_number, _packet: &[u8]| {
            Err(SendError::new(friend_number, "offline"))
        }));
        assert!(matches!(msi.invite(2, AUDIO), Err(MsiError::Send(_))));
        assert!(msi.calls().is_empty());
    }

    #[test]
    fn test_pop_always_ends_call_with_one_event() {
        // Requesting: the peer rejected us.
        let (a, a_out) = new_msi();
        let events = record_events(&a);
        a.invite(0, AUDIO).unwrap();
        a.handle_packet(0, &Message::pop().to_packet());
        assert_eq!(vec![CallEvent::End], event_names(&events));
        assert!(a.calls().is_empty());
        take_sent(&a_out);

        // Requested: the peer gave up.
        events.lock().clear();
        a.handle_packet(0, &Message::new(Request::Init, AUDIO).to_packet());
        events.lock().clear();
        a.handle_packet(0, &Message::pop().to_packet());
        assert_eq!(vec![CallEvent::End], event_names(&events));
        assert!(a.calls().is_empty());

        // Active, with an error attached.
        let (a, _, a_events, b, b_out, _) = active_call();
        b.handle_packet(1, &Message::error(ErrorCode::System).to_packet());
        assert!(b.calls().is_empty());
        assert!(take_sent(&b_out).is_empty(), "no reply to pop");
        assert!(a_events.lock().is_empty());
        assert_eq!(CallState::Active, a.call(0).unwrap().state);

        // Handler failures don't keep the call around.
        let (_, _, _, b, b_out, b_events) = active_call();
        b.set_handler(CallEvent::End, |_, _| Err(anyhow!("busy")));
        b.handle_packet(1, &Message::pop().to_packet());
        assert!(b.calls().is_empty());
        assert!(take_sent(&b_out).is_empty());
        assert!(b_events.lock().is_empty());
    }

    #[test]
    fn test_end_handler_can_call_again() {
        let (_, _, _, b, b_out, _) = active_call();
        b.set_handler(CallEvent::End, |msi, call| {
            assert!(msi.call(call.friend_number).is_none());
            msi.invite(call.friend_number, call.self_capabilities)?;
            Ok(())
        });
        b.handle_packet(1, &Message::pop().to_packet());
        assert_eq!(CallState::Requesting, b.call(1).unwrap().state);
        assert_eq!(vec![(1, Message::new(Request::Init, AUDIO))], take_sent(&b_out));

        let (_, _, _, b, _, _) = active_call();
        b.set_handler(CallEvent::PeerTimeout, |msi, call| {
            msi.invite(call.friend_number, AUDIO_VIDEO)?;
            Ok(())
        });
        b.handle_peer_status(1, false);
        assert_eq!(CallState::Requesting, b.call(1).unwrap().state);
        assert_eq!(AUDIO_VIDEO, b.call(1).unwrap().self_capabilities);
    }

    #[test]
    fn test_pop_with_error_reports_error() {
        let (_, _, _, b, _, b_events) = active_call();
        b.handle_packet(1, &Message::error(ErrorCode::Handle).to_packet());
        let events = b_events.lock();
        assert_eq!(1, events.len());
        assert_eq!(CallEvent::Error, events[0].0);
        assert_eq!(ErrorCode::Handle, events[0].1.error);
    }

    #[test]
    fn test_hangup() {
        let (a, a_out, _, b, _, b_events) = active_call();
        a.hangup(0).unwrap();
        assert!(a.calls().is_empty());
        deliver(&a_out, &b, 1);
        assert_eq!(vec![CallEvent::End], event_names(&b_events));
        assert!(b.calls().is_empty());
        assert_eq!(Err(MsiError::NoCall(0)), a.hangup(0));
    }

    #[test]
    fn test_independent_calls() {
        let (a, a_out) = new_msi();
        let _events = record_events(&a);
        a.invite(1, AUDIO).unwrap();
        a.invite(2, AUDIO_VIDEO).unwrap();
        take_sent(&a_out);

        a.hangup(1).unwrap();
        assert_eq!(vec![(1, Message::pop())], take_sent(&a_out));
        assert_eq!(None, a.call(1));
        assert_eq!(CallState::Requesting, a.call(2).unwrap().state);
        assert_eq!(AUDIO_VIDEO, a.call(2).unwrap().self_capabilities);

        a.handle_packet(2, &Message::new(Request::Push, AUDIO).to_packet());
        assert_eq!(CallState::Active, a.call(2).unwrap().state);
        assert_eq!(1, a.calls().len());
    }

    #[test]
    fn test_hangup_from_handler() {
        let (b, b_out) = new_msi();
        b.set_handler(CallEvent::Invite, |msi, call| {
            msi.hangup(call.friend_number)?;
            Ok(())
        });
        b.handle_packet(1, &Message::new(Request::Init, AUDIO).to_packet());
        assert!(b.calls().is_empty());
        assert_eq!(vec![(1, Message::pop())], take_sent(&b_out));
    }

    #[test]
    fn test_handler_failure_ends_call() {
        let (b, b_out) = new_msi();
        b.set_handler(CallEvent::Invite, |_, _| Err(anyhow!("no ringtone")));
        b.handle_packet(1, &Message::new(Request::Init, AUDIO).to_packet());
        assert!(b.calls().is_empty());
        assert_eq!(
            vec![(1, Message::error(ErrorCode::Handle))],
            take_sent(&b_out)
        );

        // A missing handler counts as a failure.
        let (a, a_out) = new_msi();
        a.invite(0, AUDIO).unwrap();
        take_sent(&a_out);
        a.handle_packet(0, &Message::new(Request::Push, AUDIO).to_packet());
        assert!(a.calls().is_empty());
        assert_eq!(
            vec![(0, Message::error(ErrorCode::Handle))],
            take_sent(&a_out)
        );
    }

    #[test]
    fn test_stray_messages() {
        let (a, a_out) = new_msi();
        let events = record_events(&a);

        a.handle_packet(4, &Message::new(Request::Push, AUDIO).to_packet());
        assert_eq!(
            vec![(4, Message::error(ErrorCode::StrayMessage))],
            take_sent(&a_out)
        );

        a.handle_packet(4, &Message::error(ErrorCode::StrayMessage).to_packet());
        a.handle_packet(4, &Message::pop().to_packet());
        assert!(take_sent(&a_out).is_empty());
        assert!(a.calls().is_empty());
        assert!(events.lock().is_empty());
    }

    #[test]
    fn test_invalid_messages() {
        let (a, a_out) = new_msi();
        let events = record_events(&a);

        a.handle_packet(4, &[MSI_PACKET_ID, 1, 1, 9, 0]);
        assert_eq!(
            vec![(4, Message::error(ErrorCode::InvalidMessage))],
            take_sent(&a_out)
        );

        let init_without_capabilities = Message {
            request: Request::Init,
            error: None,
            capabilities: None,
        };
        a.handle_packet(4, &init_without_capabilities.to_packet());
        assert_eq!(
            vec![(4, Message::error(ErrorCode::InvalidMessage))],
            take_sent(&a_out)
        );
        assert!(a.calls().is_empty());
        assert!(events.lock().is_empty());

        // Push without capabilities ends an existing call.
        a.invite(4, AUDIO).unwrap();
        take_sent(&a_out);
        let push_without_capabilities = Message {
            request: Request::Push,
            error: None,
            capabilities: None,
        };
        a.handle_packet(4, &push_without_capabilities.to_packet());
        assert_eq!(
            vec![(4, Message::error(ErrorCode::InvalidMessage))],
            take_sent(&a_out)
        );
        assert!(a.calls().is_empty());
    }

    #[test]
    fn test_init_while_requesting() {
        let (a, a_out) = new_msi();
        let events = record_events(&a);
        a.invite(4, AUDIO).unwrap();
        take_sent(&a_out);

        a.handle_packet(4, &Message::new(Request::Init, AUDIO).to_packet());
        assert_eq!(
            vec![(4, Message::error(ErrorCode::InvalidState))],
            take_sent(&a_out)
        );
        assert!(a.calls().is_empty());
        assert!(events.lock().is_empty());
    }

    #[test]
    fn test_init_while_active() {
        let (_, _, _, b, b_out, b_events) = active_call();

        // Same capabilities: just answer again.
        b.handle_packet(1, &Message::new(Request::Init, AUDIO).to_packet());
        assert_eq!(
            vec![(1, Message::new(Request::Push, AUDIO))],
            take_sent(&b_out)
        );
        assert!(b_events.lock().is_empty());

        b.handle_packet(1, &Message::new(Request::Init, AUDIO_VIDEO).to_packet());
        assert_eq!(vec![CallEvent::Capabilities], event_names(&b_events));
        assert_eq!(AUDIO_VIDEO, b.call(1).unwrap().peer_capabilities);
        assert_eq!(
            vec![(1, Message::new(Request::Push, AUDIO))],
            take_sent(&b_out)
        );
        assert_eq!(CallState::Active, b.call(1).unwrap().state);
    }

    #[test]
    fn test_change_capabilities() {
        let (a, a_out, _, b, _, b_events) = active_call();
        a.change_capabilities(0, AUDIO_VIDEO).unwrap();
        assert_eq!(AUDIO_VIDEO, a.call(0).unwrap().self_capabilities);
        deliver(&a_out, &b, 1);
        assert_eq!(vec![CallEvent::Capabilities], event_names(&b_events));
        assert_eq!(AUDIO_VIDEO, b_events.lock()[0].1.peer_capabilities);

        // Unchanged capabilities aren't reported.
        b_events.lock().clear();
        a.change_capabilities(0, AUDIO_VIDEO).unwrap();
        deliver(&a_out, &b, 1);
        assert!(b_events.lock().is_empty());

        // A failing handler ends the call.
        b.set_handler(CallEvent::Capabilities, |_, _| Err(anyhow!("unsupported")));
        a.change_capabilities(0, AUDIO).unwrap();
        deliver(&a_out, &b, 1);
        assert!(b.calls().is_empty());
    }

    #[test]
    fn test_peer_status() {
        let (_, _, _, b, b_out, b_events) = active_call();
        b.handle_peer_status(1, true);
        assert_eq!(1, b.calls().len());

        b.handle_peer_status(1, false);
        assert_eq!(vec![CallEvent::PeerTimeout], event_names(&b_events));
        assert!(b.calls().is_empty());
        assert!(take_sent(&b_out).is_empty());

        // Nothing happens without a call.
        b.handle_peer_status(1, false);
        assert_eq!(1, b_events.lock().len());
    }

    #[test]
    fn test_kill() {
        let (a, a_out) = new_msi();
        let events = record_events(&a);
        a.invite(1, AUDIO).unwrap();
        a.invite(2, AUDIO).unwrap();
        take_sent(&a_out);

        a.kill();
        assert!(a.calls().is_empty());
        let mut sent = take_sent(&a_out);
        sent.sort_by_key(|(friend_number, _)| *friend_number);
        assert_eq!(vec![(1, Message::pop()), (2, Message::pop())], sent);
        assert!(events.lock().is_empty());
    }
}
