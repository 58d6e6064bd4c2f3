//! Staged startup orchestration.
//!
//! Blocks register work at one of three stages: stage 1 runs after
//! configuration is final but before devices start (queue allocation,
//! CPI creation), stage 2 runs device and filter setup, stage 3 launches
//! the worker loops. Hooks run in registration order; a failure unwinds
//! by reporting which hook failed and aborting startup.

use tracing::{error, info};

use crate::error::Result;

type StageFn<'a> = Box<dyn FnOnce() -> Result<()> + 'a>;

#[derive(Default)]
pub struct Launch<'a> {
    stage1: Vec<(String, StageFn<'a>)>,
    stage2: Vec<(String, StageFn<'a>)>,
    stage3: Vec<(String, StageFn<'a>)>,
}

impl<'a> Launch<'a> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn at_stage1(&mut self, name: impl Into<String>, f: impl FnOnce() -> Result<()> + 'a) {
        self.stage1.push((name.into(), Box::new(f)));
    }

    pub fn at_stage2(&mut self, name: impl Into<String>, f: impl FnOnce() -> Result<()> + 'a) {
        self.stage2.push((name.into(), Box::new(f)));
    }

    pub fn at_stage3(&mut self, name: impl Into<String>, f: impl FnOnce() -> Result<()> + 'a) {
        self.stage3.push((name.into(), Box::new(f)));
    }

    /// Drop the `n` most recently registered stage-1 hooks (registration
    /// unwinding after a failed sibling registration).
    pub fn pop_n_at_stage1(&mut self, n: usize) {
        let keep = self.stage1.len().saturating_sub(n);
        self.stage1.truncate(keep);
    }

    pub fn pop_n_at_stage2(&mut self, n: usize) {
        let keep = self.stage2.len().saturating_sub(n);
        self.stage2.truncate(keep);
    }

    pub fn pop_n_at_stage3(&mut self, n: usize) {
        let keep = self.stage3.len().saturating_sub(n);
        self.stage3.truncate(keep);
    }

    /// Run all three stages in order.
    pub fn run(self) -> Result<()> {
        for (stage, hooks) in [(1, self.stage1), (2, self.stage2), (3, self.stage3)] {
            for (name, hook) in hooks {
                if let Err(e) = hook() {
                    error!(stage, hook = %name, error = %e, "startup hook failed");
                    return Err(e);
                }
                info!(stage, hook = %name, "startup hook done");
            }
        }
        Ok(())
    }
}
