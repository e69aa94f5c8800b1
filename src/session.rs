//! Session: the state bundle of one logical TLS connection.
//!
//! A [`Session`] owns the engine instance and, once the transport phase is
//! reached, the raw connection.  Its [`SessionState`] is a tagged variant:
//! data valid only in one state (the failure reason, the verification
//! outcome) lives inside that variant.
//!
//! ```text
//!  Idle ─▶ Connecting(Seeding) ─▶ … ─▶ Connecting(VerifyingPeer) ─▶ Established
//!                   │                              │                    │
//!                   └──────────▶ Failed ◀──────────┘                    │
//!                                  │                                    │
//!                                  └──────────────▶ Closed ◀────────────┘
//! ```
//!
//! [`Session::destroy`] is the single unwind path.  It is safe in every state
//! and idempotent; `Drop` calls it so an early return can never leak the
//! engine.

use core::fmt;

use log::debug;

use crate::error::ConnectError;
use crate::ports::RawConnection;
use crate::tls::TlsEngine;

/// Handshake phases, in order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Seeding,
    LoadingTrust,
    LoadingIdentity,
    TransportConnecting,
    ConfiguringTls,
    Handshaking,
    VerifyingPeer,
}

impl Phase {
    pub const ALL: [Phase; 7] = [
        Phase::Seeding,
        Phase::LoadingTrust,
        Phase::LoadingIdentity,
        Phase::TransportConnecting,
        Phase::ConfiguringTls,
        Phase::Handshaking,
        Phase::VerifyingPeer,
    ];

    pub fn name(self) -> &'static str {
        match self {
            Phase::Seeding => "Seeding",
            Phase::LoadingTrust => "LoadingTrust",
            Phase::LoadingIdentity => "LoadingIdentity",
            Phase::TransportConnecting => "TransportConnecting",
            Phase::ConfiguringTls => "ConfiguringTLS",
            Phase::Handshaking => "Handshaking",
            Phase::VerifyingPeer => "VerifyingPeer",
        }
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Why peer verification did not run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipReason {
    /// No root CA was supplied, so there is nothing to verify against.
    NoTrustAnchor,
    /// A root CA was supplied but the caller turned verification off.
    CallerDisabled,
}

/// Trust outcome of an established session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verification {
    /// The peer chain verified against the trust anchor.
    Verified,
    /// Connected but unverified.
    Skipped(SkipReason),
}

impl Verification {
    pub fn is_verified(self) -> bool {
        self == Verification::Verified
    }
}

/// Life-cycle state of a [`Session`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Idle,
    Connecting(Phase),
    Established { verification: Verification },
    Failed { phase: Phase, reason: ConnectError },
    Closed,
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Idle => write!(f, "Idle"),
            Self::Connecting(phase) => write!(f, "Connecting({phase})"),
            Self::Established {
                verification: Verification::Verified,
            } => write!(f, "Established(verified)"),
            Self::Established {
                verification: Verification::Skipped(_),
            } => write!(f, "Established(unverified)"),
            Self::Failed { phase, reason } => write!(f, "Failed({phase}: {reason})"),
            Self::Closed => write!(f, "Closed"),
        }
    }
}

/// One TLS-secured logical connection.
pub struct Session<E: TlsEngine, C: RawConnection> {
    pub(crate) engine: E,
    engine_live: bool,
    pub(crate) link: Option<C>,
    pub(crate) verify_peer: bool,
    pub(crate) verify_flags: u32,
    pub(crate) state: SessionState,
}

impl<E: TlsEngine, C: RawConnection> Session<E, C> {
    pub(crate) fn new(engine: E) -> Self {
        Self {
            engine,
            engine_live: false,
            link: None,
            verify_peer: false,
            verify_flags: 0,
            state: SessionState::Idle,
        }
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    /// Whether the peer check is active for this session.
    pub fn verify_peer(&self) -> bool {
        self.verify_peer
    }

    /// Last verification bitmask read from the engine (0 if never read).
    pub fn verify_flags(&self) -> u32 {
        self.verify_flags
    }

    /// Trust outcome, once established.
    pub fn verification(&self) -> Option<Verification> {
        match self.state {
            SessionState::Established { verification } => Some(verification),
            _ => None,
        }
    }

    pub fn engine(&self) -> &E {
        &self.engine
    }

    /// `true` while the engine or the raw connection is still allocated.
    pub fn holds_resources(&self) -> bool {
        self.engine_live || self.link.is_some()
    }

    /// Initialise the engine.  Must be the first engine call of the session.
    pub(crate) fn init_engine(&mut self) {
        debug_assert!(!self.engine_live, "engine initialised twice");
        self.engine.init();
        self.engine_live = true;
    }

    /// Engine plus live connection, for record I/O.
    pub(crate) fn channel(&mut self) -> Option<(&mut E, &mut C)> {
        let link = self.link.as_mut()?;
        Some((&mut self.engine, link))
    }

    /// Release everything acquired so far.  Safe in every state, idempotent.
    pub fn destroy(&mut self) {
        if let Some(mut link) = self.link.take() {
            link.close();
            debug!("STA: raw connection released");
        }
        if self.engine_live {
            self.engine.free();
            self.engine_live = false;
            debug!("STA: TLS engine freed");
        }
        if !matches!(self.state, SessionState::Idle) {
            self.state = SessionState::Closed;
        }
    }
}

impl<E: TlsEngine, C: RawConnection> Drop for Session<E, C> {
    fn drop(&mut self) {
        self.destroy();
    }
}
