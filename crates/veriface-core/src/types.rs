use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Directory name of the shared impostor pool.
pub const NOT_USER: &str = "not_user";

/// User ids become directory names, so they must be a single plain path
/// component and must not collide with the impostor pool.
pub fn is_valid_user_id(user_id: &str) -> bool {
    !user_id.is_empty()
        && user_id != NOT_USER
        && user_id != "."
        && user_id != ".."
        && user_id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '-' | '.'))
}

/// One of the three per-user split roots under the data directory.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Split {
    Train,
    Validation,
    Test,
}

impl Split {
    pub const ALL: [Split; 3] = [Split::Train, Split::Validation, Split::Test];

    pub fn dir_name(self) -> &'static str {
        match self {
            Split::Train => "train",
            Split::Validation => "validation",
            Split::Test => "test",
        }
    }

    /// `{base_data_dir}/{split}`.
    pub fn root(self, base_data_dir: &Path) -> PathBuf {
        base_data_dir.join(self.dir_name())
    }
}

/// Binary label of a training example.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Label {
    /// Negative class, drawn from the shared `not_user` pool.
    NotUser,
    /// Positive class, the enrolled person.
    User,
}

impl Label {
    /// Target value for binary cross-entropy.
    pub fn target(self) -> f32 {
        match self {
            Label::NotUser => 0.0,
            Label::User => 1.0,
        }
    }

    /// Class directory name under a split root.
    pub fn dir_name(self, user_id: &str) -> &str {
        match self {
            Label::NotUser => NOT_USER,
            Label::User => user_id,
        }
    }
}

/// Classifier input dimensions. Resizing always targets `width × height`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct InputShape {
    pub height: u32,
    pub width: u32,
}

impl InputShape {
    pub const CHANNELS: usize = 3;

    pub fn new(height: u32, width: u32) -> Self {
        Self { height, width }
    }
}

/// Per-class loss multipliers.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ClassWeights {
    pub not_user: f32,
    pub user: f32,
}

impl ClassWeights {
    /// Inverse-frequency balancing: `total / (2 × class_count)`.
    ///
    /// Returns `None` unless both classes have at least one example.
    pub fn balanced(not_user_count: usize, user_count: usize) -> Option<Self> {
        if not_user_count == 0 || user_count == 0 {
            return None;
        }
        let total = (not_user_count + user_count) as f64;
        Some(Self {
            not_user: (total / (2.0 * not_user_count as f64)) as f32,
            user: (total / (2.0 * user_count as f64)) as f32,
        })
    }

    pub fn for_label(&self, label: Label) -> f32 {
        match label {
            Label::NotUser => self.not_user,
            Label::User => self.user,
        }
    }
}

/// An item that could not be processed, with the reason.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ItemFailure {
    pub path: PathBuf,
    pub reason: String,
}

/// Partial-success outcome of a batch file operation.
#[derive(Debug, Clone, Default, Serialize)]
pub struct BatchReport {
    pub succeeded: Vec<PathBuf>,
    pub failed: Vec<ItemFailure>,
}

impl BatchReport {
    pub fn push_failure(&mut self, path: &Path, reason: impl ToString) {
        self.failed.push(ItemFailure {
            path: path.to_path_buf(),
            reason: reason.to_string(),
        });
    }

    /// Fraction of attempted items that failed, in [0, 1].
    pub fn failure_rate(&self) -> f64 {
        let attempted = self.succeeded.len() + self.failed.len();
        if attempted == 0 {
            0.0
        } else {
            self.failed.len() as f64 / attempted as f64
        }
    }

    pub fn extend(&mut self, other: BatchReport) {
        self.succeeded.extend(other.succeeded);
        self.failed.extend(other.failed);
    }
}

/// Seeded RNG when a seed is configured, entropy-seeded otherwise.
pub fn seeded_rng(seed: Option<u64>) -> ChaCha8Rng {
    match seed {
        Some(seed) => ChaCha8Rng::seed_from_u64(seed),
        None => ChaCha8Rng::from_entropy(),
    }
}
