use std::sync::Arc;

use postpilot_core::SchedulerConfig;
use postpilot_publishers::PublisherRegistry;

use crate::{
    control::ControlApi, daemon::DeliveryDaemon, slots::SlotAllocator, store::PostStore,
    submit::Submitter,
};

/// All scheduling components wired over one store and one registry.
#[derive(Debug, Clone)]
pub struct Engine {
    store: PostStore,
    slots: SlotAllocator,
    submitter: Submitter,
    daemon: DeliveryDaemon,
    control: ControlApi,
}

impl Engine {
    pub fn new(store: PostStore, publishers: PublisherRegistry, config: &SchedulerConfig) -> Self {
        let slots = SlotAllocator::from_config(store.clone(), config);
        let submitter = Submitter::new(store.clone(), slots.clone(), config);
        let daemon = DeliveryDaemon::new(store.clone(), Arc::new(publishers), config);
        let control = ControlApi::new(daemon.clone());
        Self {
            store,
            slots,
            submitter,
            daemon,
            control,
        }
    }

    pub fn store(&self) -> &PostStore {
        &self.store
    }

    pub fn slots(&self) -> &SlotAllocator {
        &self.slots
    }

    pub fn submitter(&self) -> &Submitter {
        &self.submitter
    }

    pub fn daemon(&self) -> &DeliveryDaemon {
        &self.daemon
    }

    pub fn control(&self) -> &ControlApi {
        &self.control
    }
}
