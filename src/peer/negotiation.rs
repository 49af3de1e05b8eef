// Perfect negotiation: решение о встречных offer'ах.
// Инициатор соединения impolite и игнорирует чужой offer при коллизии,
// принимающий polite и уступает, откатывая свой offer.

use parking_lot::Mutex;
use serde_json::Value;
use std::sync::Arc;
use tracing::debug;

use crate::error::MeshError;
use crate::peer::types::{Role, SessionDescription, SignalingState};

/// Что делать с пришедшим offer'ом
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OfferDecision {
    /// Применить (с откатом своего offer'а) и ответить answer'ом
    Accept,
    /// Ответить `null`
    Ignore,
}

#[derive(Debug)]
pub struct Negotiator {
    role: Role,
    making_offer: bool,
    ignored_offers: u64,
    yielded_offers: u64,
}

impl Negotiator {
    pub fn new(role: Role) -> Self {
        Self {
            role,
            making_offer: false,
            ignored_offers: 0,
            yielded_offers: 0,
        }
    }

    pub fn shared(role: Role) -> Arc<Mutex<Self>> {
        Arc::new(Mutex::new(Self::new(role)))
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn is_making_offer(&self) -> bool {
        self.making_offer
    }

    /// Сколько offer'ов было проигнорировано из-за коллизии
    pub fn ignored_offers(&self) -> u64 {
        self.ignored_offers
    }

    /// Сколько раз polite-сторона откатила свой offer ради чужого
    pub fn yielded_offers(&self) -> u64 {
        self.yielded_offers
    }

    pub fn on_remote_offer(&mut self, state: SignalingState) -> OfferDecision {
        let collision = self.making_offer || state != SignalingState::Stable;
        if collision && self.role == Role::Impolite {
            self.ignored_offers += 1;
            debug!(?state, making_offer = self.making_offer, "offer collision, ignoring");
            OfferDecision::Ignore
        } else {
            if collision {
                self.yielded_offers += 1;
                debug!(?state, "offer collision, yielding");
            }
            OfferDecision::Accept
        }
    }
}

/// Флаг making-offer поднят, пока guard жив
pub struct OfferGuard {
    negotiator: Arc<Mutex<Negotiator>>,
}

impl OfferGuard {
    pub fn begin(negotiator: &Arc<Mutex<Negotiator>>) -> Self {
        negotiator.lock().making_offer = true;
        Self {
            negotiator: negotiator.clone(),
        }
    }
}

impl Drop for OfferGuard {
    fn drop(&mut self) {
        self.negotiator.lock().making_offer = false;
    }
}

/// Ответ на `_description`: `null` значит offer отброшен удалённой стороной.
pub fn interpret_reply(reply: Value) -> Result<Option<SessionDescription>, MeshError> {
    if reply.is_null() {
        return Ok(None);
    }
    Ok(Some(serde_json::from_value(reply)?))
}
