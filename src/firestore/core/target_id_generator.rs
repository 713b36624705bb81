/// Hands out target ids from disjoint sequences so ids allocated by the
/// target cache (even) never collide with limbo resolution targets (odd).
#[derive(Clone, Debug)]
pub struct TargetIdGenerator {
    last_id: i32,
}

impl TargetIdGenerator {
    pub fn for_target_cache() -> Self {
        Self { last_id: 0 }
    }

    pub fn for_sync_engine() -> Self {
        Self { last_id: -1 }
    }

    /// Continues the target cache sequence after `highest`.
    pub fn seeded(highest: i32) -> Self {
        Self { last_id: highest }
    }

    pub fn next(&mut self) -> i32 {
        self.last_id += 2;
        self.last_id
    }
}
