use crate::{error::SyncError, types::ThreadPhase};

/// Gate that serializes thread creation and deletion.
///
/// At most one create/delete request may be pending; thread-scoped commands
/// are only accepted while a thread is `Active`.
#[derive(Debug, Clone)]
pub struct ThreadLifecycle {
    phase: ThreadPhase,
    phase_before_create: ThreadPhase,
}

impl Default for ThreadLifecycle {
    fn default() -> Self {
        Self {
            phase: ThreadPhase::NoThread,
            phase_before_create: ThreadPhase::NoThread,
        }
    }
}

impl ThreadLifecycle {
    pub fn phase(&self) -> ThreadPhase {
        self.phase
    }

    /// Enter `Creating`. Creating over an active thread is allowed and replaces it.
    pub fn begin_create(&mut self) -> Result<(), SyncError> {
        match self.phase {
            ThreadPhase::NoThread | ThreadPhase::Active => {
                self.phase_before_create = self.phase;
                self.phase = ThreadPhase::Creating;
                Ok(())
            }
            ThreadPhase::Creating | ThreadPhase::Deleting => Err(
                SyncError::thread_operation_in_flight(self.phase, "create_thread"),
            ),
        }
    }

    /// Resolve a pending create. A failed create restores the previous phase.
    pub fn finish_create(&mut self, success: bool) -> Result<ThreadPhase, SyncError> {
        if self.phase != ThreadPhase::Creating {
            return Err(SyncError::precondition(
                "invalid_thread_transition",
                format!("no create pending (phase {:?})", self.phase),
            ));
        }
        self.phase = if success {
            ThreadPhase::Active
        } else {
            self.phase_before_create
        };
        Ok(self.phase)
    }

    pub fn begin_delete(&mut self) -> Result<(), SyncError> {
        match self.phase {
            ThreadPhase::Active => {
                self.phase = ThreadPhase::Deleting;
                Ok(())
            }
            ThreadPhase::NoThread => Err(SyncError::no_active_thread("delete_thread")),
            ThreadPhase::Creating | ThreadPhase::Deleting => Err(
                SyncError::thread_operation_in_flight(self.phase, "delete_thread"),
            ),
        }
    }

    /// Resolve a pending delete. A failed delete leaves the thread active.
    pub fn finish_delete(&mut self, success: bool) -> Result<ThreadPhase, SyncError> {
        if self.phase != ThreadPhase::Deleting {
            return Err(SyncError::precondition(
                "invalid_thread_transition",
                format!("no delete pending (phase {:?})", self.phase),
            ));
        }
        self.phase = if success {
            ThreadPhase::NoThread
        } else {
            ThreadPhase::Active
        };
        Ok(self.phase)
    }

    /// Check that a thread-scoped command may run now.
    pub fn require_active(&self, action: &str) -> Result<(), SyncError> {
        match self.phase {
            ThreadPhase::Active => Ok(()),
            ThreadPhase::NoThread => Err(SyncError::no_active_thread(action)),
            ThreadPhase::Creating | ThreadPhase::Deleting => {
                Err(SyncError::thread_operation_in_flight(self.phase, action))
            }
        }
    }
}
