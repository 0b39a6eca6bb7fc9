use super::PROCESSOR_ID_IDEAL;
use crate::kernel::ProcessId;

/// Priority given to threads created without an explicit one.
pub const DEFAULT_PRIORITY: u32 = 44;

/// Parameters for [`KernelState::create_thread`](crate::kernel::KernelState::create_thread).
#[derive(Debug, Clone)]
pub struct ThreadParams {
    pub name: String,
    pub entry: u64,
    pub arg: u64,
    pub stack_top: u64,
    pub priority: u32,
    pub processor_id: i32,
    pub owner: ProcessId,
}

impl ThreadParams {
    pub fn new(owner: ProcessId, entry: u64) -> Self {
        Self {
            name: String::new(),
            entry,
            arg: 0,
            stack_top: 0,
            priority: DEFAULT_PRIORITY,
            processor_id: PROCESSOR_ID_IDEAL,
            owner,
        }
    }

    pub fn with_name<T: Into<String>>(mut self, name: T) -> Self {
        self.name = name.into();
        self
    }

    pub fn with_arg(mut self, arg: u64) -> Self {
        self.arg = arg;
        self
    }

    pub fn with_stack_top(mut self, stack_top: u64) -> Self {
        self.stack_top = stack_top;
        self
    }

    pub fn with_priority(mut self, priority: u32) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_processor_id(mut self, processor_id: i32) -> Self {
        self.processor_id = processor_id;
        self
    }
}
