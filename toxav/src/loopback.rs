//
// Copyright 2025 Signal Messenger, LLC
// SPDX-License-Identifier: AGPL-3.0-only
//

//! Two peers in one process, connected by simulated links.
//!
//! Each direction has a reliable queue for call signaling and a lossy queue for
//! media and bandwidth feedback. The lossy queue drops packets at random and
//! can shuffle the packets it holds back. Time only moves when the simulation
//! advances its clock.

use std::{
    collections::{HashMap, VecDeque},
    sync::Arc,
};

use anyhow::{anyhow, bail, Result};
use log::*;
use parking_lot::Mutex;
use rand::{rngs::StdRng, Rng, SeedableRng};
use toxav_common::{Duration, Instant};

use crate::{
    av::CallMedia,
    bwc::LossReportHandler,
    config::Config,
    msi::{Call, CallEvent, CallState, Capabilities, Msi},
    rtp::{FrameHandler, MediaType, RtpMessage},
    transport::{FriendNumber, LossyTransport, SendError},
};

/// How B knows A.
pub const FRIEND_A: FriendNumber = 0;
/// How A knows B.
pub const FRIEND_B: FriendNumber = 1;

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct LinkStats {
    pub lossless_packets: u64,
    pub lossy_packets: u64,
    pub lossy_dropped: u64,
}

struct Link {
    name: &'static str,
    lossless: VecDeque<Vec<u8>>,
    lossy: VecDeque<Vec<u8>>,
    loss_percent: u8,
    reorder_window: usize,
    front_overtaken: usize,
    rng: StdRng,
    stats: LinkStats,
}

impl Link {
    fn new(name: &'static str, loss_percent: u8, reorder_window: usize, seed: u64) -> Self {
        Self {
            name,
            lossless: VecDeque::new(),
            lossy: VecDeque::new(),
            loss_percent,
            reorder_window,
            front_overtaken: 0,
            rng: StdRng::seed_from_u64(seed),
            stats: LinkStats::default(),
        }
    }

    fn push_lossless(&mut self, packet: &[u8]) {
        self.stats.lossless_packets += 1;
        self.lossless.push_back(packet.to_vec());
    }

    fn push_lossy(&mut self, packet: &[u8]) {
        self.stats.lossy_packets += 1;
        if self.rng.gen_range(0..100u8) < self.loss_percent {
            trace!("link({}): dropping {} byte packet", self.name, packet.len());
            self.stats.lossy_dropped += 1;
            return;
        }
        self.lossy.push_back(packet.to_vec());
    }

    /// Holds back up to `reorder_window` packets unless flushing. A packet is
    /// overtaken at most `reorder_window` times once it reaches the front.
    fn pop_lossy(&mut self, flush: bool) -> Option<Vec<u8>> {
        if self.lossy.is_empty() || (!flush && self.lossy.len() <= self.reorder_window) {
            return None;
        }
        let candidates = self.lossy.len().min(self.reorder_window + 1);
        let index = if self.front_overtaken >= self.reorder_window {
            0
        } else {
            self.rng.gen_range(0..candidates)
        };
        if index == 0 {
            self.front_overtaken = 0;
        } else {
            self.front_overtaken += 1;
        }
        self.lossy.remove(index)
    }
}

/// What a peer observed during the call.
#[derive(Debug, Default, Clone)]
pub struct PeerStats {
    pub events: Vec<CallEvent>,
    pub audio_frames: u32,
    pub video_frames: u32,
    pub key_frames: u32,
    pub incomplete_frames: u32,
    pub loss_reports: Vec<f32>,
    pub last_frames: HashMap<MediaType, RtpMessage>,
}

impl PeerStats {
    fn record_frame(&mut self, media_type: MediaType, message: RtpMessage) {
        match media_type {
            MediaType::Audio => self.audio_frames += 1,
            MediaType::Video => self.video_frames += 1,
        }
        if message.is_key_frame() {
            self.key_frames += 1;
        }
        if !message.is_complete() {
            self.incomplete_frames += 1;
        }
        self.last_frames.insert(media_type, message);
    }
}

// The part of a peer its call handlers need.
struct Endpoint {
    name: &'static str,
    clock: Arc<Mutex<Instant>>,
    transport: Arc<LossyTransport>,
    media: Mutex<HashMap<FriendNumber, CallMedia>>,
    stats: Arc<Mutex<PeerStats>>,
    invites: Mutex<Vec<FriendNumber>>,
}

impl Endpoint {
    fn now(&self) -> Instant {
        *self.clock.lock()
    }

    fn record_event(&self, event: CallEvent) {
        self.stats.lock().events.push(event);
    }

    fn start_media(&self, friend_number: FriendNumber, peer_capabilities: Capabilities) {
        let frame_handler = |media_type: MediaType| -> Box<FrameHandler> {
            let name = self.name;
            let stats = self.stats.clone();
            Box::new(move |message: RtpMessage| {
                debug!(
                    "{}: {} frame {} ({}/{} bytes)",
                    name,
                    media_type,
                    message.header.sequence_number,
                    message.received_len(),
                    message.data.len()
                );
                stats.lock().record_frame(media_type, message);
            })
        };
        let on_loss_report: Box<LossReportHandler> = {
            let name = self.name;
            let stats = self.stats.clone();
            Box::new(move |friend_number: FriendNumber, loss: f32| {
                info!(
                    "{}: friend {} reports {:.1}% loss",
                    name,
                    friend_number,
                    loss * 100.0
                );
                stats.lock().loss_reports.push(loss);
            })
        };

        let media = CallMedia::new(
            friend_number,
            self.now(),
            peer_capabilities,
            self.transport.clone(),
            frame_handler(MediaType::Audio),
            frame_handler(MediaType::Video),
            Some(on_loss_report),
        );
        info!(
            "{}: media started with friend {}, peer capabilities {:?}",
            self.name, friend_number, peer_capabilities
        );
        self.media.lock().insert(friend_number, media);
    }

    fn end_media(&self, friend_number: FriendNumber) {
        let media = self.media.lock().remove(&friend_number);
        if media.is_some() {
            info!("{}: media ended with friend {}", self.name, friend_number);
        }
    }
}

fn register_handlers(msi: &Msi, endpoint: &Arc<Endpoint>) {
    let invited = endpoint.clone();
    msi.set_handler(CallEvent::Invite, move |_msi: &Msi, call: &Call| {
        invited.record_event(CallEvent::Invite);
        invited.invites.lock().push(call.friend_number);
        Ok(())
    });

    let started = endpoint.clone();
    msi.set_handler(CallEvent::Start, move |_msi: &Msi, call: &Call| {
        started.record_event(CallEvent::Start);
        started.start_media(call.friend_number, call.peer_capabilities);
        Ok(())
    });

    let changed = endpoint.clone();
    msi.set_handler(CallEvent::Capabilities, move |_msi: &Msi, call: &Call| {
        changed.record_event(CallEvent::Capabilities);
        let mut media = changed.media.lock();
        media
            .get_mut(&call.friend_number)
            .ok_or_else(|| anyhow!("no media with friend {}", call.friend_number))?
            .set_peer_capabilities(call.peer_capabilities);
        Ok(())
    });

    for event in [CallEvent::End, CallEvent::Error, CallEvent::PeerTimeout] {
        let ended = endpoint.clone();
        msi.set_handler(event, move |_msi: &Msi, call: &Call| {
            info!(
                "{}: call with friend {} ended ({}, {})",
                ended.name, call.friend_number, event, call.error
            );
            ended.record_event(event);
            ended.end_media(call.friend_number);
            Ok(())
        });
    }
}

/// One side of the simulated call.
pub struct Peer {
    endpoint: Arc<Endpoint>,
    msi: Msi,
}

impl Peer {
    fn new(name: &'static str, clock: Arc<Mutex<Instant>>, outgoing: Arc<Mutex<Link>>) -> Self {
        let lossless = outgoing.clone();
        let msi = Msi::new(Box::new(
            move |_friend_number: FriendNumber, packet: &[u8]| -> Result<(), SendError> {
                lossless.lock().push_lossless(packet);
                Ok(())
            },
        ));
        let transport: Arc<LossyTransport> = Arc::new(
            move |_friend_number: FriendNumber, packet: &[u8]| -> Result<(), SendError> {
                outgoing.lock().push_lossy(packet);
                Ok(())
            },
        );
        let endpoint = Arc::new(Endpoint {
            name,
            clock,
            transport,
            media: Mutex::new(HashMap::new()),
            stats: Default::default(),
            invites: Mutex::new(Vec::new()),
        });
        register_handlers(&msi, &endpoint);
        Self { endpoint, msi }
    }

    pub fn msi(&self) -> &Msi {
        &self.msi
    }

    pub fn stats(&self) -> PeerStats {
        self.endpoint.stats.lock().clone()
    }

    pub fn media_count(&self) -> usize {
        self.endpoint.media.lock().len()
    }

    pub fn call_state(&self, friend_number: FriendNumber) -> CallState {
        self.msi
            .call(friend_number)
            .map_or(CallState::Inactive, |call| call.state)
    }

    pub fn invite(&self, friend_number: FriendNumber, capabilities: Capabilities) -> Result<()> {
        self.msi.invite(friend_number, capabilities)?;
        Ok(())
    }

    /// Answers every pending invite and starts sending and receiving media.
    pub fn answer_invites(&self, capabilities: Capabilities) -> Result<()> {
        let invites: Vec<FriendNumber> = self.endpoint.invites.lock().drain(..).collect();
        for friend_number in invites {
            self.msi.answer(friend_number, capabilities)?;
            let peer_capabilities = self
                .msi
                .call(friend_number)
                .map(|call| call.peer_capabilities)
                .unwrap_or_default();
            self.endpoint.start_media(friend_number, peer_capabilities);
        }
        Ok(())
    }

    pub fn send_audio_frame(&self, friend_number: FriendNumber, frame: &[u8]) -> Result<()> {
        let now = self.endpoint.now();
        let mut media = self.endpoint.media.lock();
        media
            .get_mut(&friend_number)
            .ok_or_else(|| anyhow!("no media with friend {}", friend_number))?
            .send_audio_frame(now, frame)?;
        Ok(())
    }

    pub fn send_video_frame(
        &self,
        friend_number: FriendNumber,
        frame: &[u8],
        is_key_frame: bool,
    ) -> Result<()> {
        let now = self.endpoint.now();
        let mut media = self.endpoint.media.lock();
        media
            .get_mut(&friend_number)
            .ok_or_else(|| anyhow!("no media with friend {}", friend_number))?
            .send_video_frame(now, frame, is_key_frame)?;
        Ok(())
    }

    pub fn hang_up(&self, friend_number: FriendNumber) -> Result<()> {
        let result = self.msi.hangup(friend_number);
        self.endpoint.end_media(friend_number);
        result?;
        Ok(())
    }

    fn handle_lossless_packet(&self, friend_number: FriendNumber, packet: &[u8]) {
        self.msi.handle_packet(friend_number, packet);
    }

    fn handle_lossy_packet(&self, friend_number: FriendNumber, packet: &[u8]) {
        let now = self.endpoint.now();
        let mut media = self.endpoint.media.lock();
        match media.get_mut(&friend_number) {
            Some(media) => media.handle_lossy_packet(now, packet),
            None => debug!(
                "{}: no media with friend {}, dropping lossy packet",
                self.endpoint.name, friend_number
            ),
        }
    }
}

pub struct Loopback {
    clock: Arc<Mutex<Instant>>,
    a_to_b: Arc<Mutex<Link>>,
    b_to_a: Arc<Mutex<Link>>,
    pub a: Peer,
    pub b: Peer,
}

impl Loopback {
    pub fn new(loss_percent: u8, reorder_window: usize, seed: u64) -> Self {
        let mut rng = StdRng::seed_from_u64(seed);
        let clock = Arc::new(Mutex::new(Instant::now()));
        let a_to_b = Arc::new(Mutex::new(Link::new(
            "a->b",
            loss_percent,
            reorder_window,
            rng.gen(),
        )));
        let b_to_a = Arc::new(Mutex::new(Link::new(
            "b->a",
            loss_percent,
            reorder_window,
            rng.gen(),
        )));
        Self {
            a: Peer::new("a", clock.clone(), a_to_b.clone()),
            b: Peer::new("b", clock.clone(), b_to_a.clone()),
            clock,
            a_to_b,
            b_to_a,
        }
    }

    pub fn now(&self) -> Instant {
        *self.clock.lock()
    }

    pub fn advance(&self, by: Duration) -> Instant {
        let mut clock = self.clock.lock();
        *clock += by;
        *clock
    }

    /// Delivers queued packets until the links only hold what they keep back
    /// for reordering.
    pub fn pump(&self) {
        self.deliver(false)
    }

    /// Delivers everything still queued.
    pub fn flush(&self) {
        self.deliver(true)
    }

    pub fn link_stats(&self) -> (LinkStats, LinkStats) {
        (
            self.a_to_b.lock().stats.clone(),
            self.b_to_a.lock().stats.clone(),
        )
    }

    fn deliver(&self, flush: bool) {
        loop {
            let to_b = Self::deliver_one(&self.a_to_b, &self.b, FRIEND_A, flush);
            let to_a = Self::deliver_one(&self.b_to_a, &self.a, FRIEND_B, flush);
            if !to_b && !to_a {
                break;
            }
        }
    }

    // The link stays unlocked while the receiver handles the packet, since
    // handling it may send more.
    fn deliver_one(link: &Mutex<Link>, to: &Peer, from: FriendNumber, flush: bool) -> bool {
        let lossless = link.lock().lossless.pop_front();
        if let Some(packet) = lossless {
            to.handle_lossless_packet(from, &packet);
            return true;
        }
        let lossy = link.lock().pop_lossy(flush);
        if let Some(packet) = lossy {
            to.handle_lossy_packet(from, &packet);
            return true;
        }
        false
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Summary {
    pub seed: u64,
    pub frames_sent: u32,
    pub send_failures: u32,
    pub audio_frames_received: u32,
    pub video_frames_received: u32,
    pub key_frames_received: u32,
    pub incomplete_frames_received: u32,
    pub loss_reports: Vec<f32>,
    pub a_to_b: LinkStats,
    pub b_to_a: LinkStats,
}

/// A calls B, streams audio and video to B, and hangs up.
pub fn run(config: &Config) -> Result<Summary> {
    let seed = config.seed.unwrap_or_else(rand::random);
    info!("loopback: seed {}", seed);
    let loopback = Loopback::new(config.loss_percent, config.reorder_window, seed);
    let capabilities = Capabilities::SEND_AUDIO
        | Capabilities::SEND_VIDEO
        | Capabilities::RECEIVE_AUDIO
        | Capabilities::RECEIVE_VIDEO;

    loopback.a.invite(FRIEND_B, capabilities)?;
    loopback.pump();
    loopback.b.answer_invites(capabilities)?;
    loopback.pump();
    let state = loopback.a.call_state(FRIEND_B);
    if state != CallState::Active {
        bail!("call with friend {} never became active ({})", FRIEND_B, state);
    }

    let audio_frame = vec![0xa5; config.audio_frame_size];
    let mut send_failures = 0;
    for frame in 0..config.frames {
        loopback.advance(Duration::from_millis(config.frame_interval_ms));
        let is_key_frame =
            config.keyframe_interval != 0 && frame % config.keyframe_interval == 0;
        let video_frame = vec![frame as u8; config.video_frame_size];

        if let Err(err) = loopback.a.send_audio_frame(FRIEND_B, &audio_frame) {
            warn!("loopback: audio frame {} not sent: {:#}", frame, err);
            send_failures += 1;
        }
        if let Err(err) = loopback
            .a
            .send_video_frame(FRIEND_B, &video_frame, is_key_frame)
        {
            warn!("loopback: video frame {} not sent: {:#}", frame, err);
            send_failures += 1;
        }
        loopback.pump();
    }
    loopback.flush();

    loopback.a.hang_up(FRIEND_B)?;
    loopback.flush();

    let (a_to_b, b_to_a) = loopback.link_stats();
    let received = loopback.b.stats();
    Ok(Summary {
        seed,
        frames_sent: config.frames,
        send_failures,
        audio_frames_received: received.audio_frames,
        video_frames_received: received.video_frames,
        key_frames_received: received.key_frames,
        incomplete_frames_received: received.incomplete_frames,
        loss_reports: loopback.a.stats().loss_reports,
        a_to_b,
        b_to_a,
    })
}
