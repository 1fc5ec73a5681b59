//! Synced record types and their merge policies.

use serde::{Deserialize, Serialize};

use crate::conflict::{
    resolve_append_only, resolve_by_priority, resolve_by_timestamp, ConflictPolicy, Keyed,
    Mergeable, Prioritized, Resolution, Versioned,
};

/// Relationship state between two users.
///
/// States progress none → requested/pending → friends; `Blocked` is
/// reachable from anywhere and outranks everything.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FriendStatus {
    None,
    Requested,
    Pending,
    Friends,
    Blocked,
}

impl FriendStatus {
    /// Lattice priority of this status.
    pub fn priority(self) -> u8 {
        match self {
            FriendStatus::Blocked => 5,
            FriendStatus::Friends => 4,
            FriendStatus::Requested | FriendStatus::Pending => 3,
            FriendStatus::None => 1,
        }
    }
}

/// Directed friendship edge as seen by `user_id`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FriendEdge {
    pub id: String,
    pub user_id: String,
    pub friend_id: String,
    pub status: FriendStatus,
    pub updated_at_ms: i64,
}

impl FriendEdge {
    pub fn new(
        user_id: impl Into<String>,
        friend_id: impl Into<String>,
        status: FriendStatus,
        updated_at_ms: i64,
    ) -> Self {
        let user_id = user_id.into();
        let friend_id = friend_id.into();
        Self {
            id: format!("{}:{}", user_id, friend_id),
            user_id,
            friend_id,
            status,
            updated_at_ms,
        }
    }
}

impl Keyed for FriendEdge {
    fn key(&self) -> &str {
        &self.id
    }
}

impl Versioned for FriendEdge {
    fn updated_at_ms(&self) -> i64 {
        self.updated_at_ms
    }

    fn set_updated_at_ms(&mut self, updated_at_ms: i64) {
        self.updated_at_ms = updated_at_ms;
    }
}

impl Prioritized for FriendEdge {
    fn priority(&self) -> u8 {
        self.status.priority()
    }
}

impl Mergeable for FriendEdge {
    const POLICY: ConflictPolicy = ConflictPolicy::PriorityLattice;

    fn merge(local: &Self, remote: &Self) -> Resolution<Self> {
        resolve_by_priority(local, remote)
    }
}

/// Merge two versions of a friendship edge.
pub fn resolve_friend_conflict(local: &FriendEdge, remote: &FriendEdge) -> Resolution<FriendEdge> {
    FriendEdge::merge(local, remote)
}

/// One performed set inside a workout.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExerciseSet {
    pub exercise_id: String,
    pub reps: u32,
    pub weight_kg: f64,
}

/// Logged workout session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Workout {
    pub id: String,
    pub user_id: String,
    pub name: String,
    #[serde(default)]
    pub sets: Vec<ExerciseSet>,
    pub started_at_ms: i64,
    pub completed_at_ms: Option<i64>,
    pub updated_at_ms: i64,
    #[serde(default)]
    pub deleted: bool,
}

/// Workout template.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Routine {
    pub id: String,
    pub user_id: String,
    pub name: String,
    #[serde(default)]
    pub exercise_ids: Vec<String>,
    pub updated_at_ms: i64,
    #[serde(default)]
    pub deleted: bool,
}

macro_rules! last_write_wins {
    ($ty:ty) => {
        impl Keyed for $ty {
            fn key(&self) -> &str {
                &self.id
            }
        }

        impl Versioned for $ty {
            fn updated_at_ms(&self) -> i64 {
                self.updated_at_ms
            }

            fn set_updated_at_ms(&mut self, updated_at_ms: i64) {
                self.updated_at_ms = updated_at_ms;
            }
        }

        impl Mergeable for $ty {
            const POLICY: ConflictPolicy = ConflictPolicy::LastWriteWins;

            fn merge(local: &Self, remote: &Self) -> Resolution<Self> {
                resolve_by_timestamp(local, remote)
            }
        }
    };
}

last_write_wins!(Workout);
last_write_wins!(Routine);

/// Merge two versions of a workout.
pub fn resolve_workout_conflict(local: &Workout, remote: &Workout) -> Resolution<Workout> {
    Workout::merge(local, remote)
}

/// Merge two versions of a routine.
pub fn resolve_routine_conflict(local: &Routine, remote: &Routine) -> Resolution<Routine> {
    Routine::merge(local, remote)
}

/// Social feed post.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Post {
    pub id: String,
    pub author_id: String,
    pub body: String,
    pub workout_id: Option<String>,
    pub created_at_ms: i64,
}

/// Reaction to a post.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Reaction {
    pub id: String,
    pub post_id: String,
    pub user_id: String,
    pub kind: String,
    pub created_at_ms: i64,
}

/// Comment on a post.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Comment {
    pub id: String,
    pub post_id: String,
    pub author_id: String,
    pub body: String,
    pub created_at_ms: i64,
}

macro_rules! append_only {
    ($ty:ty) => {
        impl Keyed for $ty {
            fn key(&self) -> &str {
                &self.id
            }
        }

        impl Mergeable for $ty {
            const POLICY: ConflictPolicy = ConflictPolicy::AppendOnly;

            fn merge(local: &Self, remote: &Self) -> Resolution<Self> {
                resolve_append_only(local, remote)
            }
        }
    };
}

append_only!(Post);
append_only!(Reaction);
append_only!(Comment);

/// Merge two versions of a post.
pub fn resolve_post_conflict(local: &Post, remote: &Post) -> Resolution<Post> {
    Post::merge(local, remote)
}
