//! The Module Registry: single source of truth for module state
//!
//! Every read hands out a copy and every write goes through [`Registry::save`]
//! or [`Registry::update`], so no caller keeps a reference across an unlocked
//! window. Network calls happen on the copy, outside the lock.

use crate::error::HubError;
use crate::module::{ModuleDescriptor, ModuleState};
use parking_lot::Mutex;
use std::collections::HashMap;
use tracing::debug;

pub struct Registry {
    modules: Mutex<HashMap<String, ModuleDescriptor>>,
}

impl Default for Registry {
    fn default() -> Self {
        Self::new()
    }
}

impl Registry {
    /// Empty registry holding only the `hub` descriptor
    pub fn new() -> Self {
        let hub = ModuleDescriptor::hub();
        let mut modules = HashMap::new();
        modules.insert(hub.name.clone(), hub);
        Self {
            modules: Mutex::new(modules),
        }
    }

    /// Registry populated from configuration; duplicate names are rejected
    pub fn with_modules(
        descriptors: impl IntoIterator<Item = ModuleDescriptor>,
    ) -> Result<Self, HubError> {
        let registry = Self::new();
        for descriptor in descriptors {
            registry.register(descriptor)?;
        }
        Ok(registry)
    }

    /// Add a new module. A second descriptor with an existing name is an error.
    pub fn register(&self, descriptor: ModuleDescriptor) -> Result<(), HubError> {
        let mut modules = self.modules.lock();
        if modules.contains_key(&descriptor.name) {
            return Err(HubError::DuplicateModule(descriptor.name));
        }
        debug!(module = %descriptor.name, state = %descriptor.state, "Module registered");
        modules.insert(descriptor.name.clone(), descriptor);
        Ok(())
    }

    pub fn get(&self, name: &str) -> Option<ModuleDescriptor> {
        self.modules.lock().get(name).cloned()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.modules.lock().contains_key(name)
    }

    /// Linear scan for the module presenting `hash` as its identifier
    pub fn find_by_credential(&self, hash: &str) -> Option<ModuleDescriptor> {
        if hash.is_empty() {
            return None;
        }
        self.modules
            .lock()
            .values()
            .find(|m| m.module_hash.as_deref() == Some(hash))
            .cloned()
    }

    /// Upsert by name
    pub fn save(&self, descriptor: ModuleDescriptor) {
        self.modules
            .lock()
            .insert(descriptor.name.clone(), descriptor);
    }

    /// Apply `f` to the stored descriptor under the lock and return the updated copy
    pub fn update<F>(&self, name: &str, f: F) -> Option<ModuleDescriptor>
    where
        F: FnOnce(&mut ModuleDescriptor),
    {
        let mut modules = self.modules.lock();
        let descriptor = modules.get_mut(name)?;
        f(descriptor);
        Some(descriptor.clone())
    }

    /// [`Registry::update`] that first claims `hash` for `name`.
    ///
    /// Fails with the holder's name when another module already presents `hash`.
    pub fn update_claiming<F>(
        &self,
        name: &str,
        hash: &str,
        f: F,
    ) -> Result<Option<ModuleDescriptor>, String>
    where
        F: FnOnce(&mut ModuleDescriptor),
    {
        let mut modules = self.modules.lock();
        if let Some(holder) = modules
            .values()
            .find(|m| m.name != name && m.module_hash.as_deref() == Some(hash))
        {
            return Err(holder.name.clone());
        }
        Ok(modules.get_mut(name).map(|descriptor| {
            f(descriptor);
            descriptor.clone()
        }))
    }

    /// Returns false when the module is unknown
    pub fn set_state(&self, name: &str, state: ModuleState) -> bool {
        self.update(name, |m| {
            if m.state != state {
                debug!(module = %m.name, from = %m.state, to = %state, "State change");
            }
            m.state = state;
        })
        .is_some()
    }

    pub fn state_of(&self, name: &str) -> Option<ModuleState> {
        self.modules.lock().get(name).map(|m| m.state)
    }

    /// All descriptors, sorted by name
    pub fn snapshot(&self) -> Vec<ModuleDescriptor> {
        let mut all: Vec<_> = self.modules.lock().values().cloned().collect();
        all.sort_by(|a, b| a.name.cmp(&b.name));
        all
    }

    pub fn len(&self) -> usize {
        self.modules.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.modules.lock().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::module::HUB_NAME;
    use std::sync::Arc;

    #[test]
    fn test_new_contains_hub() {
        let registry = Registry::new();
        assert_eq!(registry.len(), 1);
        let hub = registry.get(HUB_NAME).unwrap();
        assert_eq!(hub.state, ModuleState::Online);
        assert_eq!(registry.find_by_credential(HUB_NAME).unwrap().name, HUB_NAME);
    }

    #[test]
    fn test_register_rejects_duplicate_names() {
        let registry = Registry::new();
        registry.register(ModuleDescriptor::new("blog")).unwrap();

        let err = registry
            .register(ModuleDescriptor::new("blog").with_state(ModuleState::Online))
            .unwrap_err();
        assert!(matches!(err, HubError::DuplicateModule(ref n) if n == "blog"));

        assert_eq!(registry.len(), 2);
        assert_eq!(registry.state_of("blog"), Some(ModuleState::Unknown));
    }

    #[test]
    fn test_hub_name_cannot_be_registered() {
        let registry = Registry::new();
        assert!(registry.register(ModuleDescriptor::new(HUB_NAME)).is_err());
    }

    #[test]
    fn test_with_modules_rejects_duplicates() {
        let result = Registry::with_modules(vec![
            ModuleDescriptor::new("a"),
            ModuleDescriptor::new("a"),
        ]);
        assert!(result.is_err());
    }

    #[test]
    fn test_get_returns_copy() {
        let registry = Registry::new();
        registry.register(ModuleDescriptor::new("blog")).unwrap();

        let mut copy = registry.get("blog").unwrap();
        copy.state = ModuleState::Online;
        assert_eq!(registry.state_of("blog"), Some(ModuleState::Unknown));

        registry.save(copy);
        assert_eq!(registry.state_of("blog"), Some(ModuleState::Online));
        assert_eq!(registry.len(), 2);
    }

    #[test]
    fn test_missing_lookups_are_none() {
        let registry = Registry::new();
        assert!(registry.get("nope").is_none());
        assert!(registry.find_by_credential("nope").is_none());
        assert!(registry.find_by_credential("").is_none());
        assert!(!registry.set_state("nope", ModuleState::Online));
        assert!(registry.update("nope", |_| {}).is_none());
    }

    #[test]
    fn test_find_by_credential() {
        let registry = Registry::new();
        let mut module = ModuleDescriptor::new("blog");
        module.module_hash = Some("abc123".to_string());
        registry.register(module).unwrap();

        assert_eq!(registry.find_by_credential("abc123").unwrap().name, "blog");
        assert!(registry.find_by_credential("abc").is_none());
    }

    #[test]
    fn test_update_claiming_rejects_held_hash() {
        let registry = Registry::new();
        let mut blog = ModuleDescriptor::new("blog");
        blog.module_hash = Some("shared".to_string());
        registry.register(blog).unwrap();
        registry.register(ModuleDescriptor::new("shop")).unwrap();

        let err = registry
            .update_claiming("shop", "shared", |m| m.pid = 1)
            .unwrap_err();
        assert_eq!(err, "blog");
        assert_eq!(registry.get("shop").unwrap().pid, 0);

        assert_eq!(registry.update_claiming("shop", HUB_NAME, |_| {}).unwrap_err(), HUB_NAME);

        // a module may re-present its own hash
        let updated = registry.update_claiming("blog", "shared", |m| m.pid = 2).unwrap();
        assert_eq!(updated.unwrap().pid, 2);
        assert!(registry.update_claiming("nope", "fresh", |_| {}).unwrap().is_none());
    }

    #[test]
    fn test_update_returns_updated_copy() {
        let registry = Registry::new();
        registry.register(ModuleDescriptor::new("blog")).unwrap();
        let updated = registry.update("blog", |m| m.pid = 42).unwrap();
        assert_eq!(updated.pid, 42);
        assert_eq!(registry.get("blog").unwrap().pid, 42);
    }

    #[test]
    fn test_snapshot_sorted() {
        let registry = Registry::new();
        registry.register(ModuleDescriptor::new("zeta")).unwrap();
        registry.register(ModuleDescriptor::new("alpha")).unwrap();
        let names: Vec<_> = registry.snapshot().into_iter().map(|m| m.name).collect();
        assert_eq!(names, vec!["alpha", "hub", "zeta"]);
    }

    #[test]
    fn test_concurrent_saves_keep_one_entry() {
        let registry = Arc::new(Registry::new());
        registry.register(ModuleDescriptor::new("blog")).unwrap();

        let handles: Vec<_> = (0..8)
            .map(|i| {
                let registry = Arc::clone(&registry);
                std::thread::spawn(move || {
                    for _ in 0..100 {
                        let mut copy = registry.get("blog").unwrap();
                        copy.pid = i;
                        registry.save(copy);
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }
        assert_eq!(registry.len(), 2);
    }
}
