use std::collections::HashMap;
use std::sync::Arc;

use super::Site;

/// Registry of sites, keyed by name.
#[derive(Default)]
pub struct SiteRegistry {
    sites: HashMap<String, Arc<dyn Site>>,
}

impl SiteRegistry {
    /// Create a new empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self {
            sites: HashMap::new(),
        }
    }

    /// Register a site, replacing any site with the same name.
    pub fn register(&mut self, site: Arc<dyn Site>) {
        self.sites.insert(site.name().to_string(), site);
    }

    /// Find a site by name.
    #[must_use]
    pub fn find(&self, name: &str) -> Option<Arc<dyn Site>> {
        self.sites.get(name).cloned()
    }

    /// Names of all registered sites, sorted.
    #[must_use]
    pub fn names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.sites.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }
}
