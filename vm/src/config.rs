use kidneyos_shared::mem::{USER_POOL_BASE, USER_POOL_FRAMES};

/// How the user pool picks a free frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Placement {
    /// Continue searching where the last allocation left off.
    #[default]
    NextFit,
    /// Always take the lowest free frame.
    FirstFit,
}

/// How the frame table picks a victim when the pool is exhausted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Replacement {
    /// Round-robin: the first unpinned frame under the cursor is evicted.
    #[default]
    ClockSweep,
    /// Like `ClockSweep`, but recently accessed frames are passed over once.
    SecondChance,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VmConfig {
    /// Number of frames in the user pool.
    pub user_frames: usize,
    /// Physical address of the first frame in the user pool.
    pub pool_base: usize,
    pub placement: Placement,
    pub replacement: Replacement,
    /// Never evict a process's topmost stack page.
    pub protect_stack_sentinel: bool,
}

impl Default for VmConfig {
    fn default() -> Self {
        Self {
            user_frames: USER_POOL_FRAMES,
            pool_base: USER_POOL_BASE,
            placement: Placement::default(),
            replacement: Replacement::default(),
            protect_stack_sentinel: true,
        }
    }
}

impl VmConfig {
    pub fn with_user_frames(mut self, user_frames: usize) -> Self {
        self.user_frames = user_frames;
        self
    }

    pub fn with_placement(mut self, placement: Placement) -> Self {
        self.placement = placement;
        self
    }

    pub fn with_replacement(mut self, replacement: Replacement) -> Self {
        self.replacement = replacement;
        self
    }

    pub fn with_stack_sentinel(mut self, protect: bool) -> Self {
        self.protect_stack_sentinel = protect;
        self
    }
}
