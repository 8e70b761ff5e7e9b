pub mod arbiter;
pub mod engine;
pub mod lifecycle;
pub mod registry;
pub mod scheduler;
pub mod store;

mod error;
mod util;

pub use arbiter::*;
pub use engine::*;
pub use error::*;
pub use lifecycle::*;
pub use registry::*;
pub use scheduler::*;
pub use store::*;

use rand::Rng;
use serde::{Deserialize, Serialize};

// Request/response types shared by the scheduler and the HTTP surface.
#[derive(Deserialize, Serialize, Debug, Clone, PartialEq)]
pub struct GenerationRequest {
    pub model_id: String,
    pub prompt: String,
    pub negative_prompt: Option<String>,
    pub width: Option<usize>,
    pub height: Option<usize>,
    pub steps: Option<usize>,
    pub guidance_scale: Option<f64>,
    #[serde(default)]
    pub seed: Seed,
}

/// How the seed for a generation is chosen: a fixed value, or `"random"`
/// to draw a fresh one and report it back.
#[derive(Deserialize, Serialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(untagged)]
pub enum Seed {
    Fixed(u64),
    Mode(SeedMode),
}

#[derive(Deserialize, Serialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum SeedMode {
    Random,
}

impl Default for Seed {
    fn default() -> Self {
        Seed::Mode(SeedMode::Random)
    }
}

impl Seed {
    /// The seed to generate with. Random draws stay below 2^32 - 1.
    pub fn resolve(self) -> u64 {
        match self {
            Seed::Fixed(seed) => seed,
            Seed::Mode(SeedMode::Random) => rand::thread_rng().gen_range(0..u64::from(u32::MAX)),
        }
    }
}

/// A finished generation: the encoded image plus the seed that produced
/// it. Resubmitting identical parameters with that seed reproduces the
/// image byte for byte.
#[derive(Debug, Clone)]
pub struct GenerationResult {
    pub image_png: Vec<u8>,
    pub seed: u64,
    pub elapsed_ms: u64,
}
