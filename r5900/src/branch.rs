//! Branch and delay slot bookkeeping for the unit being compiled.

/// Where a branch stands relative to the instruction being compiled.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum BranchState {
    NoBranch,
    /// Branch compiled, slot next. Afterwards control goes wherever the branch left next_pc.
    DelaySlotTaken,
    /// Branch compiled and known not taken, slot next
    DelaySlotNotTaken,
    /// The slot has been emitted and the unit has to end
    Perform,
}

/// Where a unit continues once it performs its branch.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum JumpTarget {
    /// Byte offset from the unit's entry pc
    Static(u32),
    /// Whatever the unit stored to next_pc
    Dynamic,
}

/// What the compiler can tell about a branch condition
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum Outcome {
    Always,
    Never,
    Runtime,
}

#[derive(Debug, Clone)]
pub struct BranchTracker {
    state: BranchState,
    target: JumpTarget,
    likely: bool,
    in_delay_slot_taken: bool,
    in_delay_slot_not_taken: bool,
}

impl BranchTracker {
    pub fn new() -> BranchTracker {
        BranchTracker {
            state: BranchState::NoBranch,
            target: JumpTarget::Dynamic,
            likely: false,
            in_delay_slot_taken: false,
            in_delay_slot_not_taken: false,
        }
    }

    pub fn reset(&mut self) {
        *self = BranchTracker::new();
    }

    pub fn state(&self) -> BranchState {
        self.state
    }

    pub fn likely(&self) -> bool {
        self.likely
    }

    /// A branch was compiled at byte offset `offset` of the unit.
    pub fn on_branch(&mut self, outcome: Outcome, likely: bool, offset: u32) {
        assert_eq!(self.state, BranchState::NoBranch, "branch compiled while another one is unresolved");
        self.likely = likely;
        match outcome {
            Outcome::Always | Outcome::Runtime => {
                self.state = BranchState::DelaySlotTaken;
                self.target = JumpTarget::Dynamic;
            }
            Outcome::Never => {
                self.state = BranchState::DelaySlotNotTaken;
                self.target = JumpTarget::Static(offset + 8);
            }
        }
    }

    /// The next unit picks up a branch the previous one couldn't fit the delay slot of. Whether
    /// it was taken is only known at run time.
    pub fn resume_deferred(&mut self) {
        assert_eq!(self.state, BranchState::NoBranch);
        self.state = BranchState::DelaySlotTaken;
        self.target = JumpTarget::Dynamic;
        self.likely = false;
    }

    /// A deferred branch has been checked and not taken, compilation carries on sequentially.
    pub fn resolve_deferred(&mut self) {
        assert_eq!(self.state, BranchState::Perform);
        self.reset();
    }

    pub fn enter_delay_slot(&mut self) {
        assert!(!self.in_delay_slot(), "already compiling a delay slot");
        match self.state {
            BranchState::DelaySlotTaken => self.in_delay_slot_taken = true,
            BranchState::DelaySlotNotTaken => self.in_delay_slot_not_taken = true,
            state => panic!("no delay slot to compile in state {:?}", state),
        }
    }

    pub fn leave_delay_slot(&mut self) {
        assert!(self.in_delay_slot());
        self.in_delay_slot_taken = false;
        self.in_delay_slot_not_taken = false;
        self.state = BranchState::Perform;
    }

    /// A likely branch that's never taken: the slot is skipped and execution carries on after it.
    pub fn nullify(&mut self) {
        assert_eq!(self.state, BranchState::DelaySlotNotTaken);
        assert!(self.likely);
        self.state = BranchState::Perform;
    }

    /// Ends the unit without a delay slot (ERET, exceptions).
    pub fn perform(&mut self, target: JumpTarget) {
        self.state = BranchState::Perform;
        self.target = target;
    }

    /// Branch compiled, delay slot not yet emitted
    pub fn pending(&self) -> bool {
        matches!(self.state, BranchState::DelaySlotTaken | BranchState::DelaySlotNotTaken) && !self.in_delay_slot()
    }

    pub fn in_delay_slot(&self) -> bool {
        self.in_delay_slot_taken || self.in_delay_slot_not_taken
    }

    /// Set once the unit has to end
    pub fn perform_target(&self) -> Option<JumpTarget> {
        match self.state {
            BranchState::Perform => Some(self.target),
            _ => None,
        }
    }

    /// Target of the pending branch
    pub fn target(&self) -> JumpTarget {
        self.target
    }
}

impl Default for BranchTracker {
    fn default() -> Self {
        Self::new()
    }
}
