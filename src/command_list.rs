use std::sync::Arc;

use crate::backend::{
    AccelerationStructureInputs, Command, CommandAllocatorId, DispatchRaysDesc,
    RaytracingBackend,
};
use crate::context::{Context, Retire};
use crate::deferred::DeferredBuffer;
use crate::pipeline::PipelineState;

/// A command list and the allocator backing it. Recorded once, closed, executed once.
#[must_use]
pub struct CommandList {
    context: Arc<Context>,
    allocator: Option<CommandAllocatorId>,
    commands: Vec<Command>,
}

/// A command list that can no longer be recorded into, ready for
/// [`Context::execute_command_list`].
#[must_use]
pub struct ClosedCommandList {
    context: Arc<Context>,
    allocator: Option<CommandAllocatorId>,
    commands: Vec<Command>,
}

pub(crate) struct RetiredCommandAllocator(pub CommandAllocatorId);

impl Retire for RetiredCommandAllocator {
    fn retire(self: Box<Self>, backend: &mut dyn RaytracingBackend) {
        backend.destroy_command_allocator(self.0);
    }
}

impl CommandList {
    pub(crate) fn new(context: Arc<Context>, allocator: CommandAllocatorId) -> Self {
        Self {
            context,
            allocator: Some(allocator),
            commands: Vec::new(),
        }
    }

    pub fn context(&self) -> &Arc<Context> {
        &self.context
    }

    pub fn add_cmd(&mut self, command: Command) -> &mut Self {
        self.commands.push(command);
        self
    }

    pub fn build_acceleration_structure(
        &mut self,
        inputs: AccelerationStructureInputs,
        dest: &DeferredBuffer,
        scratch: &DeferredBuffer,
    ) -> &mut Self {
        self.add_cmd(Command::BuildAccelerationStructure {
            inputs,
            dest: dest.resource(),
            scratch: scratch.resource(),
        })
    }

    /// Orders a previous write to `buffer` before everything recorded after it.
    pub fn uav_barrier(&mut self, buffer: &DeferredBuffer) -> &mut Self {
        self.add_cmd(Command::UavBarrier {
            resource: Some(buffer.resource()),
        })
    }

    pub fn set_pipeline(&mut self, pipeline: &PipelineState) -> &mut Self {
        self.add_cmd(Command::SetPipeline(pipeline.id()))
    }

    pub fn dispatch_rays(&mut self, desc: DispatchRaysDesc) -> &mut Self {
        self.add_cmd(Command::DispatchRays(desc))
    }

    pub fn commands(&self) -> &[Command] {
        &self.commands
    }

    pub fn close(mut self) -> ClosedCommandList {
        ClosedCommandList {
            context: self.context.clone(),
            allocator: self.allocator.take(),
            commands: std::mem::take(&mut self.commands),
        }
    }
}

impl Drop for CommandList {
    fn drop(&mut self) {
        if let Some(allocator) = self.allocator.take() {
            self.context
                .defer_retire(Box::new(RetiredCommandAllocator(allocator)));
        }
    }
}

impl ClosedCommandList {
    pub fn context(&self) -> &Arc<Context> {
        &self.context
    }

    pub fn len(&self) -> usize {
        self.commands.len()
    }

    pub fn is_empty(&self) -> bool {
        self.commands.is_empty()
    }

    /// Moves the allocator and commands out for submission.
    pub(crate) fn take(&mut self) -> (Option<CommandAllocatorId>, Vec<Command>) {
        (self.allocator.take(), std::mem::take(&mut self.commands))
    }
}

impl Drop for ClosedCommandList {
    fn drop(&mut self) {
        if let Some(allocator) = self.allocator.take() {
            self.context
                .defer_retire(Box::new(RetiredCommandAllocator(allocator)));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{FallbackBackend, FallbackOptions};

    #[test]
    fn recording_keeps_command_order() {
        let context = Context::new(Box::new(FallbackBackend::new(FallbackOptions::default())));
        let buffer = context.upload_data(&[0; 4], false).unwrap();
        let mut list = context.create_command_list_allocator_pair().unwrap();
        list.uav_barrier(&buffer)
            .add_cmd(Command::UavBarrier { resource: None });
        assert_eq!(
            list.commands(),
            &[
                Command::UavBarrier {
                    resource: Some(buffer.resource())
                },
                Command::UavBarrier { resource: None },
            ]
        );
        let closed = list.close();
        assert_eq!(closed.len(), 2);
        // Closing hands the allocator over, nothing is retired yet.
        assert_eq!(context.pending_deletions(), 0);
        context.execute_command_list(closed).unwrap();
        assert_eq!(context.pending_deletions(), 1);
    }

    #[test]
    fn lists_from_another_context_are_rejected() {
        let a = Context::new(Box::new(FallbackBackend::new(FallbackOptions::default())));
        let b = Context::new(Box::new(FallbackBackend::new(FallbackOptions::default())));
        let list = a.create_command_list_allocator_pair().unwrap().close();
        assert!(b.execute_command_list(list).is_err());
    }
}
