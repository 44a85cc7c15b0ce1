// Copyright 2019 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! VFIO group notifier chain and the NVLink2 ownership callback.

use std::sync::Arc;
use std::sync::Weak;

use log::debug;
use log::error;
use sync::Mutex;
use vfio_sys::VFIO_GROUP_NOTIFY_SET_KVM;

use super::Error;
use super::Nvlink2Device;
use super::PartitionId;
use super::Result;

/// An event raised on a VFIO group.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum GroupEvent {
    /// The group was associated with a guest (`Some`) or dissociated from it (`None`).
    SetKvm(Option<PartitionId>),
    /// Any other notification; carries the raw action value.
    Other(u64),
}

type Callback = Box<dyn Fn(&GroupEvent) -> Result<()> + Send>;

struct Subscriber {
    id: u64,
    callback: Callback,
}

#[derive(Default)]
struct ChainState {
    next_id: u64,
    subscribers: Vec<Subscriber>,
    guest: Option<PartitionId>,
}

/// Notifier chain of one VFIO group.
///
/// Callbacks run under the chain lock, in registration order, so dropping a [`Subscription`]
/// waits for any notification in progress and no callback fires after the drop returns.
#[derive(Clone, Default)]
pub struct GroupNotifier {
    state: Arc<Mutex<ChainState>>,
}

impl GroupNotifier {
    pub fn new() -> Self {
        GroupNotifier::default()
    }

    /// Subscribes `callback` to the events in the `events` mask.
    pub fn register<F>(&self, events: u64, callback: F) -> Result<Subscription>
    where
        F: Fn(&GroupEvent) -> Result<()> + Send + 'static,
    {
        if events == 0 || events & !VFIO_GROUP_NOTIFY_SET_KVM != 0 {
            return Err(Error::UnsupportedEvents(events));
        }
        let mut state = self.state.lock();
        let id = state.next_id;
        state.next_id += 1;
        state.subscribers.push(Subscriber {
            id,
            callback: Box::new(callback),
        });
        Ok(Subscription {
            chain: Arc::downgrade(&self.state),
            id,
        })
    }

    /// Delivers `event` to every subscriber, stopping at the first one that rejects it.
    ///
    /// A rejected `SetKvm` leaves the recorded guest association unchanged.
    pub fn notify(&self, event: GroupEvent) -> Result<()> {
        let mut state = self.state.lock();
        for subscriber in &state.subscribers {
            (subscriber.callback)(&event)?;
        }
        if let GroupEvent::SetKvm(guest) = event {
            state.guest = guest;
        }
        Ok(())
    }

    /// The guest the group is currently associated with.
    pub fn guest(&self) -> Option<PartitionId> {
        self.state.lock().guest
    }

    pub fn subscriber_count(&self) -> usize {
        self.state.lock().subscribers.len()
    }
}

/// Registration of a callback on a [`GroupNotifier`]; dropping it unregisters the callback.
#[must_use]
pub struct Subscription {
    chain: Weak<Mutex<ChainState>>,
    id: u64,
}

impl Subscription {
    pub fn unregister(self) {}
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(chain) = self.chain.upgrade() {
            chain.lock().subscribers.retain(|s| s.id != self.id);
        }
    }
}

/// Keeps NPU routing in step with the guest that owns the GPU's VFIO group.
pub struct OwnershipNotifier {
    device: Arc<Nvlink2Device>,
}

impl OwnershipNotifier {
    pub fn new(device: Arc<Nvlink2Device>) -> Self {
        OwnershipNotifier { device }
    }

    /// Handles one group event. Only `SetKvm` is acted upon; other events are acknowledged.
    pub fn handle(&self, event: &GroupEvent) -> Result<()> {
        match event {
            GroupEvent::SetKvm(guest) => {
                debug!(
                    "NVLink2 {}: routing to {}",
                    self.device.gpu(),
                    guest.unwrap_or(PartitionId::HOST)
                );
                self.device.set_guest(*guest).map_err(|e| {
                    error!("{}", e);
                    e
                })
            }
            GroupEvent::Other(_) => Ok(()),
        }
    }

    pub fn subscribe(self, notifier: &GroupNotifier) -> Result<Subscription> {
        notifier.register(VFIO_GROUP_NOTIFY_SET_KVM, move |event| self.handle(event))
    }
}
