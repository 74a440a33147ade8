use std::{
    num::NonZeroUsize,
    sync::{
        Arc, Weak,
        atomic::{AtomicUsize, Ordering},
    },
};

use log::debug;
use ndarray::{Array2, ArrayView2, ArrayViewMut2};
use parking_lot::Mutex;

use crate::{GroupId, PolicySpec, Result, SyncErr, SynchronizationAgent};

/// The optimization coefficients of one trainable tensor.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Coefficients {
    /// The learning rate, `0` freezes the tensor.
    pub epsilon: f32,
    pub momentum: f32,
    pub decay: f32,
}

impl From<PolicySpec> for Coefficients {
    fn from(spec: PolicySpec) -> Self {
        let (epsilon, momentum, decay) = spec.coefficients();
        Self {
            epsilon,
            momentum,
            decay,
        }
    }
}

/// The device side copies the compute kernels work on.
#[derive(Debug)]
struct DeviceMirror {
    weights: Array2<f32>,
    momentum: Array2<f32>,
    grads: Array2<f32>,
}

#[derive(Debug)]
struct Storage {
    host_weights: Array2<f32>,
    host_momentum: Array2<f32>,
    device: Option<DeviceMirror>,
}

/// Everything an authoritative handle owns, mirrors only point at it.
#[derive(Debug)]
struct Record {
    id: GroupId,
    coefficients: Coefficients,
    storage: Mutex<Storage>,
    updates: AtomicUsize,
    agent: Arc<SynchronizationAgent>,
}

#[derive(Debug)]
enum Link {
    Owner(Arc<Record>),
    Mirror(Weak<Record>),
}

/// The compute side view of one trainable tensor.
///
/// The authoritative handle owns the host and device storage and pushes its
/// gradient through the agent on every `update`. A mirror shares the tensor
/// with another layer: it never owns storage, every call is forwarded to the
/// authoritative handle and only the latter actually updates.
#[derive(Debug)]
pub struct ParameterHandle {
    link: Link,
}

impl ParameterHandle {
    /// Creates a new authoritative `ParameterHandle`, registering a channel for it.
    ///
    /// # Arguments
    /// * `agent` - The node's synchronization agent.
    /// * `weights` - The initial host weights.
    /// * `spec` - The policy the tensor's channel combines deltas with.
    pub fn new(agent: &Arc<SynchronizationAgent>, weights: Array2<f32>, spec: PolicySpec) -> Self {
        let id = agent.register_channel(spec.build());
        let host_momentum = Array2::zeros(weights.raw_dim());

        let record = Record {
            id,
            coefficients: spec.into(),
            storage: Mutex::new(Storage {
                host_weights: weights,
                host_momentum,
                device: None,
            }),
            updates: AtomicUsize::new(0),
            agent: Arc::clone(agent),
        };

        Self {
            link: Link::Owner(Arc::new(record)),
        }
    }

    /// Creates a mirror of this handle, sharing its storage and update counter.
    pub fn mirror(&self) -> Self {
        let source = match &self.link {
            Link::Owner(record) => Arc::downgrade(record),
            Link::Mirror(source) => Weak::clone(source),
        };

        Self {
            link: Link::Mirror(source),
        }
    }

    pub fn is_authoritative(&self) -> bool {
        matches!(self.link, Link::Owner(_))
    }

    fn record(&self) -> Result<Arc<Record>> {
        match &self.link {
            Link::Owner(record) => Ok(Arc::clone(record)),
            Link::Mirror(source) => source.upgrade().ok_or(SyncErr::Detached),
        }
    }

    /// The id of the channel this tensor is synchronized through.
    pub fn id(&self) -> Result<GroupId> {
        self.record().map(|record| record.id)
    }

    pub fn coefficients(&self) -> Result<Coefficients> {
        self.record().map(|record| record.coefficients)
    }

    /// Shares the device gradient and applies one optimization step.
    ///
    /// Does nothing on mirrors and on frozen tensors.
    ///
    /// # Arguments
    /// * `batch_size` - The amount of samples the gradient was summed over.
    ///
    /// # Returns
    /// An `Uninitialized` error if the device storage doesn't exist yet,
    /// or whatever the agent failed with.
    pub fn update(&self, batch_size: NonZeroUsize) -> Result<()> {
        let Link::Owner(record) = &self.link else {
            return Ok(());
        };

        if record.coefficients.epsilon == 0. {
            return Ok(());
        }

        let mut storage = record.storage.lock();
        let DeviceMirror {
            weights,
            momentum,
            grads,
        } = storage
            .device
            .as_mut()
            .ok_or(SyncErr::Uninitialized { id: record.id })?;

        record.agent.send_and_recv(
            record.id,
            grads.view(),
            momentum.view_mut(),
            weights.view_mut(),
            batch_size,
        )?;

        record.updates.store(0, Ordering::Release);
        Ok(())
    }

    /// Counts one more contribution to the pending gradient.
    pub fn increment_update_count(&self) -> Result<()> {
        self.record()?.updates.fetch_add(1, Ordering::AcqRel);
        Ok(())
    }

    /// The contributions since the last `update`, shared with every mirror.
    pub fn update_count(&self) -> Result<usize> {
        Ok(self.record()?.updates.load(Ordering::Acquire))
    }

    /// Uploads the host weights and momentum to the device, creating the
    /// device storage on the first call. Mirrors alias the source's device
    /// storage so this does nothing on them.
    pub fn copy_to_device(&self) -> Result<()> {
        let Link::Owner(record) = &self.link else {
            return Ok(());
        };

        let mut storage = record.storage.lock();
        let Storage {
            host_weights,
            host_momentum,
            device,
        } = &mut *storage;

        match device {
            Some(device) => {
                device.weights.assign(host_weights);
                device.momentum.assign(host_momentum);
            }
            None => {
                *device = Some(DeviceMirror {
                    weights: host_weights.clone(),
                    momentum: host_momentum.clone(),
                    grads: Array2::zeros(host_weights.raw_dim()),
                });
                debug!(id = record.id; "device storage created");
            }
        }

        Ok(())
    }

    /// Downloads the device weights and momentum into the host copies.
    /// Does nothing on mirrors.
    pub fn copy_to_host(&self) -> Result<()> {
        let Link::Owner(record) = &self.link else {
            return Ok(());
        };

        let mut storage = record.storage.lock();
        let Storage {
            host_weights,
            host_momentum,
            device,
        } = &mut *storage;

        let device = device
            .as_ref()
            .ok_or(SyncErr::Uninitialized { id: record.id })?;

        host_weights.assign(&device.weights);
        host_momentum.assign(&device.momentum);
        Ok(())
    }

    /// Gives `f` the device gradient to write into.
    ///
    /// # Returns
    /// What `f` returned, or an `Uninitialized` error if the device storage
    /// doesn't exist yet.
    pub fn with_grads<R>(&self, f: impl FnOnce(ArrayViewMut2<f32>) -> R) -> Result<R> {
        let record = self.record()?;
        let mut storage = record.storage.lock();
        let device = storage
            .device
            .as_mut()
            .ok_or(SyncErr::Uninitialized { id: record.id })?;

        Ok(f(device.grads.view_mut()))
    }

    /// Gives `f` a read only view of the device weights.
    pub fn with_weights<R>(&self, f: impl FnOnce(ArrayView2<f32>) -> R) -> Result<R> {
        let record = self.record()?;
        let storage = record.storage.lock();
        let device = storage
            .device
            .as_ref()
            .ok_or(SyncErr::Uninitialized { id: record.id })?;

        Ok(f(device.weights.view()))
    }

    /// A copy of the host weights.
    pub fn host_weights(&self) -> Result<Array2<f32>> {
        Ok(self.record()?.storage.lock().host_weights.clone())
    }
}
