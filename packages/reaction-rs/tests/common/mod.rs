// Common test utilities

use std::sync::{Arc, Mutex, MutexGuard, Once};

use reaction::{ActionPayload, Lineage};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

static TRACING: Once = Once::new();

/// Install a test subscriber once. `RUST_LOG` overrides the default filter.
pub fn init_tracing() {
    TRACING.call_once(|| {
        let _ = tracing_subscriber::registry()
            .with(
                tracing_subscriber::EnvFilter::try_from_default_env()
                    .unwrap_or_else(|_| "warn,reaction=debug".into()),
            )
            .with(tracing_subscriber::fmt::layer().with_test_writer())
            .try_init();
    });
}

// =============================================================================
// Fixtures
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Seat {
    Player,
    Opponent,
}

impl Seat {
    pub fn other(self) -> Self {
        match self {
            Seat::Player => Seat::Opponent,
            Seat::Opponent => Seat::Player,
        }
    }
}

#[derive(Debug)]
pub struct PlayCard {
    pub name: &'static str,
}
impl ActionPayload for PlayCard {}

#[derive(Debug)]
pub struct DealDamage {
    pub target: Seat,
    pub amount: u32,
}

impl ActionPayload for DealDamage {
    fn identity_context(&self, lineage: &Lineage) -> String {
        format!("{};target={:?}", lineage.canonical(), self.target)
    }
}

#[derive(Debug)]
pub struct Draw {
    pub count: usize,
}
impl ActionPayload for Draw {}

#[derive(Debug)]
pub struct Discard {
    pub count: usize,
}
impl ActionPayload for Discard {}

/// Minimal game state mutated by performers.
#[derive(Debug)]
pub struct Board {
    pub player_hp: u32,
    pub opponent_hp: u32,
    pub deck: Vec<&'static str>,
    pub hand: Vec<&'static str>,
    pub graveyard: Vec<&'static str>,
}

impl Board {
    pub fn new(deck: &[&'static str]) -> Arc<Mutex<Self>> {
        Arc::new(Mutex::new(Self {
            player_hp: 20,
            opponent_hp: 20,
            deck: deck.to_vec(),
            hand: Vec::new(),
            graveyard: Vec::new(),
        }))
    }

    pub fn hp_mut(&mut self, seat: Seat) -> &mut u32 {
        match seat {
            Seat::Player => &mut self.player_hp,
            Seat::Opponent => &mut self.opponent_hp,
        }
    }
}

pub fn lock(board: &Arc<Mutex<Board>>) -> MutexGuard<'_, Board> {
    board.lock().unwrap()
}
