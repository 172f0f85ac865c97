//! Command-channel lock with a diagnosable holder tag.
//!
//! A single exclusive lock serializes all control operations. The operation
//! currently holding it is published in an atomic side field, so a stalled
//! channel can be attributed to a specific request.

use parking_lot::{Mutex, MutexGuard};
use std::ops::{Deref, DerefMut};
use std::sync::atomic::{AtomicU8, Ordering};
use std::time::{Duration, Instant};

/// Operation tags. `NoLock` means the lock is free.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum LockId {
    NoLock = 0,
    SetScreenCallback,
    SetOnConnectCallback,
    SetOnCloseCallback,
    Init,
    Close,
    AddPlugin,
    DelPlugin,
    EditPlugin,
    HidePlugin,
    GetPluginSettings,
    SetPluginSettings,
    BypassPlugin,
    UnbypassPlugin,
    ExchangePlugins,
    GetRecents,
    SetPreset,
    GetParameterValue,
    SetParameterValue,
    GetAllParameterValues,
    SendMouseEvent,
    KeyPressed,
    UpdateScreenCaptureArea,
    Rescan,
    UpdateCpuLoad,
    GetLoadedPluginsString,
    GetPlugins,
    IsReady,
}

impl LockId {
    const ALL: [LockId; 28] = [
        LockId::NoLock,
        LockId::SetScreenCallback,
        LockId::SetOnConnectCallback,
        LockId::SetOnCloseCallback,
        LockId::Init,
        LockId::Close,
        LockId::AddPlugin,
        LockId::DelPlugin,
        LockId::EditPlugin,
        LockId::HidePlugin,
        LockId::GetPluginSettings,
        LockId::SetPluginSettings,
        LockId::BypassPlugin,
        LockId::UnbypassPlugin,
        LockId::ExchangePlugins,
        LockId::GetRecents,
        LockId::SetPreset,
        LockId::GetParameterValue,
        LockId::SetParameterValue,
        LockId::GetAllParameterValues,
        LockId::SendMouseEvent,
        LockId::KeyPressed,
        LockId::UpdateScreenCaptureArea,
        LockId::Rescan,
        LockId::UpdateCpuLoad,
        LockId::GetLoadedPluginsString,
        LockId::GetPlugins,
        LockId::IsReady,
    ];

    fn from_u8(raw: u8) -> Self {
        Self::ALL
            .get(raw as usize)
            .copied()
            .unwrap_or(LockId::NoLock)
    }
}

impl std::fmt::Display for LockId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            LockId::NoLock => "NOLOCK",
            LockId::SetScreenCallback => "SETPLUGINSCREENUPDATECALLBACK",
            LockId::SetOnConnectCallback => "SETONCONNECTCALLBACK",
            LockId::SetOnCloseCallback => "SETONCLOSECALLBACK",
            LockId::Init => "INIT",
            LockId::Close => "CLOSE",
            LockId::AddPlugin => "ADDPLUGIN",
            LockId::DelPlugin => "DELPLUGIN",
            LockId::EditPlugin => "EDITPLUGIN",
            LockId::HidePlugin => "HIDEPLUGIN",
            LockId::GetPluginSettings => "GETPLUGINSETTINGS",
            LockId::SetPluginSettings => "SETPLUGINSETTINGS",
            LockId::BypassPlugin => "BYPASSPLUGIN",
            LockId::UnbypassPlugin => "UNBYPASSPLUGIN",
            LockId::ExchangePlugins => "EXCHANGEPLUGINS",
            LockId::GetRecents => "GETRECENTS",
            LockId::SetPreset => "SETPRESET",
            LockId::GetParameterValue => "GETPARAMETERVALUE",
            LockId::SetParameterValue => "SETPARAMETERVALUE",
            LockId::GetAllParameterValues => "GETALLPARAMETERVALUES",
            LockId::SendMouseEvent => "SENDMOUSEEVENT",
            LockId::KeyPressed => "KEYPRESSED",
            LockId::UpdateScreenCaptureArea => "UPDATESCREENCAPTUREAREA",
            LockId::Rescan => "RESCAN",
            LockId::UpdateCpuLoad => "UPDATECPULOAD",
            LockId::GetLoadedPluginsString => "GETLOADEDPLUGINSSTRING",
            LockId::GetPlugins => "GETPLUGINS",
            LockId::IsReady => "ISREADY",
        };
        f.write_str(name)
    }
}

/// Exclusive lock that records which operation holds it.
pub struct TaggedMutex<T> {
    inner: Mutex<T>,
    holder: AtomicU8,
}

pub struct TaggedGuard<'a, T> {
    guard: MutexGuard<'a, T>,
    holder: &'a AtomicU8,
    id: LockId,
}

impl<T> TaggedMutex<T> {
    pub fn new(value: T) -> Self {
        Self {
            inner: Mutex::new(value),
            holder: AtomicU8::new(LockId::NoLock as u8),
        }
    }

    /// Operation currently holding the lock.
    pub fn holder(&self) -> LockId {
        LockId::from_u8(self.holder.load(Ordering::Acquire))
    }

    /// Blocking acquire, for user-initiated operations.
    pub fn lock(&self, id: LockId) -> TaggedGuard<'_, T> {
        let guard = match self.inner.try_lock() {
            Some(guard) => guard,
            None => {
                tracing::debug!("{} waiting for command lock held by {}", id, self.holder());
                self.inner.lock()
            }
        };
        self.tag(guard, id)
    }

    /// Best-effort acquire; `None` if another operation holds the lock.
    pub fn try_lock(&self, id: LockId) -> Option<TaggedGuard<'_, T>> {
        self.inner.try_lock().map(|guard| self.tag(guard, id))
    }

    /// Best-effort acquire that keeps trying until `timeout` has passed.
    pub fn try_lock_for(&self, id: LockId, timeout: Duration) -> Option<TaggedGuard<'_, T>> {
        let deadline = Instant::now() + timeout;
        self.inner
            .try_lock_until(deadline)
            .map(|guard| self.tag(guard, id))
    }

    fn tag<'a>(&'a self, guard: MutexGuard<'a, T>, id: LockId) -> TaggedGuard<'a, T> {
        self.holder.store(id as u8, Ordering::Release);
        TaggedGuard {
            guard,
            holder: &self.holder,
            id,
        }
    }
}

impl<T> Deref for TaggedGuard<'_, T> {
    type Target = T;

    fn deref(&self) -> &T {
        &self.guard
    }
}

impl<T> DerefMut for TaggedGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        &mut self.guard
    }
}

impl<T> Drop for TaggedGuard<'_, T> {
    fn drop(&mut self) {
        // Cleared while still holding the mutex; the next holder tags after us.
        self.holder.store(LockId::NoLock as u8, Ordering::Release);
        tracing::trace!("{} released command lock", self.id);
    }
}
