//! Sync-chain & resource planner.
//!
//! Builds, per resource, an append-only vector of `ResourceState` entries
//! (the "sync chain") from the resolved pass order, plus a list of explicit
//! barrier records for non-attachment resource uses. Each image barrier is
//! deactivated in place, at the point it's recorded, if a renderpass
//! attachment earlier in the pass order already synchronized that resource
//! via its implicit subpass dependencies; buffer barriers are never
//! deactivated since buffers have no renderpass-implied synchronization to
//! ride on.

use std::collections::{HashMap, HashSet};

use ash::vk;

use crate::handle::ResourceHandle;
use crate::pass::{ImageAttachment, QueueKind, RenderPass};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResourceState {
    pub access_flags: vk::AccessFlags,
    pub stage_mask: vk::PipelineStageFlags,
    /// `UNDEFINED` for buffers, where layout is meaningless.
    pub image_layout: vk::ImageLayout,
}

impl ResourceState {
    fn neutral() -> ResourceState {
        ResourceState {
            access_flags: vk::AccessFlags::empty(),
            stage_mask: vk::PipelineStageFlags::TOP_OF_PIPE,
            image_layout: vk::ImageLayout::UNDEFINED,
        }
    }

    fn swapchain_initial() -> ResourceState {
        ResourceState {
            access_flags: vk::AccessFlags::empty(),
            stage_mask: vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT,
            image_layout: vk::ImageLayout::UNDEFINED,
        }
    }

    fn bottom_of_pipe() -> ResourceState {
        ResourceState {
            access_flags: vk::AccessFlags::empty(),
            stage_mask: vk::PipelineStageFlags::BOTTOM_OF_PIPE,
            image_layout: vk::ImageLayout::UNDEFINED,
        }
    }

    fn present_src() -> ResourceState {
        ResourceState {
            access_flags: vk::AccessFlags::empty(),
            stage_mask: vk::PipelineStageFlags::BOTTOM_OF_PIPE,
            image_layout: vk::ImageLayout::PRESENT_SRC_KHR,
        }
    }
}

/// An explicit barrier request recorded for a non-attachment resource use.
/// `active == false` means a subsequent renderpass attachment already
/// synchronizes this transition; the backend skips emitting it.
#[derive(Debug, Clone, Copy)]
pub struct ExplicitSyncOp {
    pub resource: ResourceHandle,
    pub index_before: usize,
    pub index_after: usize,
    pub active: bool,
    /// Position (in the resolved pass slice) of the pass that requires this
    /// transition; lets the backend emit barriers immediately before the
    /// right command buffer without replaying the planner's own bookkeeping.
    pub pass_index: usize,
}

pub struct SyncPlan {
    pub chains: HashMap<ResourceHandle, Vec<ResourceState>>,
    pub explicit_ops: Vec<ExplicitSyncOp>,
}

impl SyncPlan {
    pub fn chain_for(&self, handle: ResourceHandle) -> Option<&[ResourceState]> {
        self.chains.get(&handle).map(|v| v.as_slice())
    }

    /// Active barriers that must be issued immediately before the command
    /// buffer for `pass_index`, together with the before/after states to
    /// build the `vk::ImageMemoryBarrier`/`vk::BufferMemoryBarrier` from.
    pub fn barriers_for_pass(&self, pass_index: usize) -> Vec<(ExplicitSyncOp, ResourceState, ResourceState)> {
        self.explicit_ops
            .iter()
            .filter(|op| op.active && op.pass_index == pass_index)
            .map(|op| {
                let chain = &self.chains[&op.resource];
                (*op, chain[op.index_before], chain[op.index_after])
            })
            .collect()
    }
}

fn stage_for_queue(queue_kind: QueueKind) -> vk::PipelineStageFlags {
    match queue_kind {
        QueueKind::Graphics => vk::PipelineStageFlags::VERTEX_SHADER,
        QueueKind::Compute => vk::PipelineStageFlags::COMPUTE_SHADER,
        QueueKind::Transfer => vk::PipelineStageFlags::TRANSFER,
    }
}

/// Derives the state a non-attachment use requires: sampled image →
/// `ShaderReadOnlyOptimal`; storage image (read+write, per the conservative
/// image-read rule in `pass.rs`) → `General`; buffers carry no layout.
fn derive_required_state(handle: ResourceHandle, access_flags: vk::AccessFlags, queue_kind: QueueKind) -> ResourceState {
    let stage = stage_for_queue(queue_kind);
    if handle.is_image() {
        if access_flags.contains(vk::AccessFlags::SHADER_WRITE) {
            ResourceState {
                access_flags: vk::AccessFlags::SHADER_READ | vk::AccessFlags::SHADER_WRITE,
                stage_mask: stage,
                image_layout: vk::ImageLayout::GENERAL,
            }
        } else {
            ResourceState {
                access_flags: vk::AccessFlags::SHADER_READ,
                stage_mask: stage,
                image_layout: vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL,
            }
        }
    } else {
        ResourceState { access_flags, stage_mask: stage, image_layout: vk::ImageLayout::UNDEFINED }
    }
}

fn attachment_layout(att: &ImageAttachment) -> vk::ImageLayout {
    if att.is_depth_stencil {
        vk::ImageLayout::DEPTH_STENCIL_ATTACHMENT_OPTIMAL
    } else {
        vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL
    }
}

/// State "as seen on entry": load-op aware, so a `LOAD` attachment
/// requires a read-visible prior state while `CLEAR`/`DONT_CARE` require
/// nothing from whatever came before.
fn attachment_entry_state(att: &ImageAttachment, stage: vk::PipelineStageFlags) -> ResourceState {
    let access = if att.load_op == vk::AttachmentLoadOp::LOAD {
        if att.is_depth_stencil {
            vk::AccessFlags::DEPTH_STENCIL_ATTACHMENT_READ
        } else {
            vk::AccessFlags::COLOR_ATTACHMENT_READ
        }
    } else {
        vk::AccessFlags::empty()
    };
    ResourceState { access_flags: access, stage_mask: stage, image_layout: attachment_layout(att) }
}

/// State during the subpass itself: the write side of the attachment,
/// present whenever its store op keeps the result.
fn attachment_subpass_state(att: &ImageAttachment, stage: vk::PipelineStageFlags) -> ResourceState {
    let access = if att.store_op == vk::AttachmentStoreOp::STORE {
        if att.is_depth_stencil {
            vk::AccessFlags::DEPTH_STENCIL_ATTACHMENT_WRITE
        } else {
            vk::AccessFlags::COLOR_ATTACHMENT_WRITE
        }
    } else {
        vk::AccessFlags::empty()
    };
    ResourceState { access_flags: access, stage_mask: stage, image_layout: attachment_layout(att) }
}

/// Placeholder entry patched by whichever pass next requires this resource;
/// left as a neutral state if nothing ever claims it.
fn attachment_dummy_state(stage: vk::PipelineStageFlags) -> ResourceState {
    ResourceState { access_flags: vk::AccessFlags::empty(), stage_mask: stage, image_layout: vk::ImageLayout::UNDEFINED }
}

/// Runs the planner over a resolved, ordered pass list. `persisted_states`
/// carries each resource's state left over from the backend's previous
/// frame; a resource used for the first time starts from a neutral state.
pub fn plan_sync(passes: &[RenderPass], persisted_states: &HashMap<ResourceHandle, ResourceState>) -> SyncPlan {
    let mut chains: HashMap<ResourceHandle, Vec<ResourceState>> = HashMap::new();
    let mut order: Vec<ResourceHandle> = Vec::new();
    let mut explicit_ops: Vec<ExplicitSyncOp> = Vec::new();
    let mut attachment_high_water: HashMap<ResourceHandle, usize> = HashMap::new();
    // Index of each resource's most recent unresolved dummy entry, if any.
    let mut pending_dummy: HashMap<ResourceHandle, usize> = HashMap::new();

    let mut ensure_chain = |handle: ResourceHandle, chains: &mut HashMap<ResourceHandle, Vec<ResourceState>>| {
        if !chains.contains_key(&handle) {
            order.push(handle);
            let initial = persisted_states.get(&handle).copied().unwrap_or_else(|| {
                if handle.is_root() {
                    ResourceState::swapchain_initial()
                } else {
                    ResourceState::neutral()
                }
            });
            chains.insert(handle, vec![initial]);
        }
    };

    for (pass_index, pass) in passes.iter().enumerate() {
        let data = pass.data();
        let stage = stage_for_queue(data.queue_kind);
        let attachment_handles: HashSet<ResourceHandle> = data.attachments.iter().map(|a| a.handle).collect();

        for use_ in data.uses.iter().filter(|u| !attachment_handles.contains(&u.handle)) {
            ensure_chain(use_.handle, &mut chains);
            if let Some(&dummy_index) = pending_dummy.get(&use_.handle) {
                let required = derive_required_state(use_.handle, use_.access_flags, data.queue_kind);
                let chain = chains.get_mut(&use_.handle).unwrap();
                chain[dummy_index] = required;
                pending_dummy.remove(&use_.handle);
                continue;
            }
            let chain = chains.get_mut(&use_.handle).unwrap();
            let before = chain.len() - 1;
            chain.push(derive_required_state(use_.handle, use_.access_flags, data.queue_kind));
            let after = chain.len() - 1;
            // Buffers never ride on implicit subpass dependencies, so only
            // images can be deactivated here. Compare against the high-water
            // mark accumulated from passes strictly before this one: this
            // pass's own attachments (processed below) haven't updated it
            // yet, so a resource used here and only later bound as an
            // attachment correctly keeps its barrier active.
            let mut active = true;
            if use_.handle.is_image() {
                if let Some(&high_water) = attachment_high_water.get(&use_.handle) {
                    if high_water >= after {
                        active = false;
                    }
                }
            }
            explicit_ops.push(ExplicitSyncOp { resource: use_.handle, index_before: before, index_after: after, active, pass_index });
        }

        for att in &data.attachments {
            ensure_chain(att.handle, &mut chains);
            if let Some(&dummy_index) = pending_dummy.get(&att.handle) {
                let chain = chains.get_mut(&att.handle).unwrap();
                chain[dummy_index] = attachment_entry_state(att, stage);
                pending_dummy.remove(&att.handle);
            } else {
                let chain = chains.get_mut(&att.handle).unwrap();
                chain.push(attachment_entry_state(att, stage));
            }
            let chain = chains.get_mut(&att.handle).unwrap();
            attachment_high_water.insert(att.handle, chain.len() - 1);
            chain.push(attachment_subpass_state(att, stage));
            attachment_high_water.insert(att.handle, chain.len() - 1);
            chain.push(attachment_dummy_state(stage));
            pending_dummy.insert(att.handle, chain.len() - 1);
        }
    }

    for handle in &order {
        let chain = chains.get_mut(handle).unwrap();
        chain.push(if handle.is_root() { ResourceState::present_src() } else { ResourceState::bottom_of_pipe() });
    }

    SyncPlan { chains, explicit_ops }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handle::{buffer_resource, image_resource};

    #[test]
    fn running_the_planner_twice_on_the_same_input_is_idempotent() {
        let a = RenderPass::new("a", QueueKind::Compute).use_image_resource(image_resource("tex"), vk::AccessFlags::SHADER_READ);
        let b = RenderPass::new("b", QueueKind::Compute).use_image_resource(image_resource("tex"), vk::AccessFlags::SHADER_READ);
        let passes = vec![a, b];
        let persisted = HashMap::new();

        let plan_one = plan_sync(&passes, &persisted);
        let plan_two = plan_sync(&passes, &persisted);

        let handle = image_resource("tex");
        assert_eq!(plan_one.chain_for(handle), plan_two.chain_for(handle));
        assert_eq!(plan_one.explicit_ops.len(), plan_two.explicit_ops.len());
    }

    #[test]
    fn buffer_barriers_are_never_deactivated() {
        let buffer = buffer_resource("ubo");
        let pass = RenderPass::new("compute", QueueKind::Compute).use_buffer_resource(buffer, vk::AccessFlags::UNIFORM_READ);
        let plan = plan_sync(&[pass], &HashMap::new());
        assert!(plan.explicit_ops.iter().all(|op| !op.resource.is_buffer() || op.active));
    }

    #[test]
    fn an_image_use_preceding_a_later_attachment_stays_active() {
        let img = image_resource("ping");
        let consumer = RenderPass::new("sample", QueueKind::Compute).use_image_resource(img, vk::AccessFlags::SHADER_READ);
        let producer_as_attachment =
            RenderPass::new("draw", QueueKind::Graphics).add_color_attachment(img, vk::AttachmentLoadOp::LOAD, vk::AttachmentStoreOp::STORE, vk::ClearValue::default());
        let plan = plan_sync(&[consumer, producer_as_attachment], &HashMap::new());
        let op = plan.explicit_ops.iter().find(|op| op.resource == img).unwrap();
        assert!(op.active, "no attachment has synchronized this resource yet at the time this use runs");
    }

    #[test]
    fn an_image_use_following_a_preceding_attachment_is_deactivated() {
        let img = image_resource("ping");
        let producer_as_attachment =
            RenderPass::new("draw", QueueKind::Graphics).add_color_attachment(img, vk::AttachmentLoadOp::CLEAR, vk::AttachmentStoreOp::STORE, vk::ClearValue::default());
        let consumer = RenderPass::new("sample", QueueKind::Compute).use_image_resource(img, vk::AccessFlags::SHADER_READ);
        let plan = plan_sync(&[producer_as_attachment, consumer], &HashMap::new());
        let op = plan.explicit_ops.iter().find(|op| op.resource == img).unwrap();
        assert!(!op.active, "the preceding attachment's implicit subpass dependency already covers this transition");
    }

    #[test]
    fn swapchain_image_chain_ends_in_present_src() {
        let swapchain = ResourceHandle::swapchain_image("backbuffer");
        let pass = RenderPass::new("present", QueueKind::Graphics).add_color_attachment(
            swapchain,
            vk::AttachmentLoadOp::CLEAR,
            vk::AttachmentStoreOp::STORE,
            vk::ClearValue::default(),
        );
        let plan = plan_sync(&[pass], &HashMap::new());
        let chain = plan.chain_for(swapchain).unwrap();
        assert_eq!(chain.last().unwrap().image_layout, vk::ImageLayout::PRESENT_SRC_KHR);
    }
}
