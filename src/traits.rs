// Copyright (c) 2024 Mike Tsao. All rights reserved.

//! Common behaviors of system components.

/// Something that can be saved by the host application, and that knows whether
/// its current state has diverged from the saved one.
pub trait HasSettings {
    /// Whether the current state has been saved to disk.
    fn has_been_saved(&self) -> bool;
    /// Call this whenever the state changes. Sets the corresponding flag.
    fn needs_save(&mut self);
    /// Call this after a load() or a save(). Clears the corresponding flag.
    fn mark_clean(&mut self);
}
