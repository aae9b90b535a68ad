//! Local site, plugin, locale and maintenance bookkeeping for a node.
//!
//! These stand in for the content layer: they track which sites are active, which
//! plugins are installed, which locales were loaded and whether maintenance mode is on
//! in this process, and log every change.

use std::collections::HashSet;
use std::collections::HashMap;
use std::sync::RwLock;

use async_trait::async_trait;
use tracing::info;

use clustercmd_infra::jobs::{LocaleService, MaintenanceService, PluginService, SiteService};

#[derive(Debug, Default)]
pub struct LocalSites {
    active: RwLock<HashSet<String>>,
}

impl LocalSites {
    pub fn is_active(&self, site: &str) -> bool {
        self.active.read().map(|s| s.contains(site)).unwrap_or(false)
    }
}

#[async_trait]
impl SiteService for LocalSites {
    async fn activate(&self, site: &str) -> anyhow::Result<()> {
        let mut active = self
            .active
            .write()
            .map_err(|_| anyhow::anyhow!("site table poisoned"))?;
        if active.insert(site.to_string()) {
            info!(site, "site activated");
        }
        Ok(())
    }

    async fn deactivate(&self, site: &str) -> anyhow::Result<()> {
        let mut active = self
            .active
            .write()
            .map_err(|_| anyhow::anyhow!("site table poisoned"))?;
        if active.remove(site) {
            info!(site, "site deactivated");
        }
        Ok(())
    }
}

/// Installed plugins, keyed by `(plugin, site)`; `None` is cluster-wide.
#[derive(Debug, Default)]
pub struct LocalPlugins {
    installed: RwLock<HashSet<(String, Option<String>)>>,
}

impl LocalPlugins {
    pub fn is_installed(&self, plugin: &str, site: Option<&str>) -> bool {
        self.installed
            .read()
            .map(|p| p.contains(&(plugin.to_string(), site.map(str::to_string))))
            .unwrap_or(false)
    }
}

#[async_trait]
impl PluginService for LocalPlugins {
    async fn install(&self, plugin: &str, site: Option<&str>) -> anyhow::Result<()> {
        let mut installed = self
            .installed
            .write()
            .map_err(|_| anyhow::anyhow!("plugin table poisoned"))?;
        if !installed.insert((plugin.to_string(), site.map(str::to_string))) {
            anyhow::bail!("plugin {plugin} is already installed");
        }
        info!(plugin, site, "plugin installed");
        Ok(())
    }

    async fn uninstall(&self, plugin: &str, site: Option<&str>) -> anyhow::Result<()> {
        let mut installed = self
            .installed
            .write()
            .map_err(|_| anyhow::anyhow!("plugin table poisoned"))?;
        if !installed.remove(&(plugin.to_string(), site.map(str::to_string))) {
            anyhow::bail!("plugin {plugin} is not installed");
        }
        info!(plugin, site, "plugin uninstalled");
        Ok(())
    }
}

/// Loaded locales and how often each was reloaded.
#[derive(Debug, Default)]
pub struct LocalLocales {
    loads: RwLock<HashMap<(String, Option<String>), u32>>,
}

impl LocalLocales {
    pub fn reloads(&self, locale: &str, site: Option<&str>) -> u32 {
        self.loads
            .read()
            .ok()
            .and_then(|l| l.get(&(locale.to_string(), site.map(str::to_string))).copied())
            .unwrap_or(0)
    }
}

#[async_trait]
impl LocaleService for LocalLocales {
    async fn reload(&self, locale: &str, site: Option<&str>) -> anyhow::Result<()> {
        let mut loads = self
            .loads
            .write()
            .map_err(|_| anyhow::anyhow!("locale table poisoned"))?;
        *loads.entry((locale.to_string(), site.map(str::to_string))).or_default() += 1;
        info!(locale, site, "locale reloaded");
        Ok(())
    }
}

/// Maintenance flags; the `None` key covers the whole node.
#[derive(Debug, Default)]
pub struct LocalMaintenance {
    enabled: RwLock<HashSet<Option<String>>>,
}

impl LocalMaintenance {
    pub fn is_enabled(&self, site: Option<&str>) -> bool {
        self.enabled
            .read()
            .map(|e| e.contains(&None) || e.contains(&site.map(str::to_string)))
            .unwrap_or(false)
    }
}

#[async_trait]
impl MaintenanceService for LocalMaintenance {
    async fn set_maintenance(&self, enabled: bool, site: Option<&str>) -> anyhow::Result<()> {
        let mut flags = self
            .enabled
            .write()
            .map_err(|_| anyhow::anyhow!("maintenance table poisoned"))?;
        let key = site.map(str::to_string);
        let changed = if enabled { flags.insert(key) } else { flags.remove(&key) };
        if changed {
            info!(enabled, site, "maintenance mode changed");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn sites_toggle() {
        let sites = LocalSites::default();
        sites.activate("blog").await.unwrap();
        sites.activate("blog").await.unwrap();
        assert!(sites.is_active("blog"));
        sites.deactivate("blog").await.unwrap();
        assert!(!sites.is_active("blog"));
    }

    #[tokio::test]
    async fn plugins_reject_double_install() {
        let plugins = LocalPlugins::default();
        plugins.install("comments", Some("blog")).await.unwrap();
        assert!(plugins.is_installed("comments", Some("blog")));
        assert!(!plugins.is_installed("comments", None));
        assert!(plugins.install("comments", Some("blog")).await.is_err());
        plugins.uninstall("comments", Some("blog")).await.unwrap();
        assert!(plugins.uninstall("comments", Some("blog")).await.is_err());
    }

    #[tokio::test]
    async fn locale_reloads_are_counted_per_site() {
        let locales = LocalLocales::default();
        locales.reload("de-DE", None).await.unwrap();
        locales.reload("de-DE", None).await.unwrap();
        locales.reload("de-DE", Some("shop")).await.unwrap();
        assert_eq!(locales.reloads("de-DE", None), 2);
        assert_eq!(locales.reloads("de-DE", Some("shop")), 1);
        assert_eq!(locales.reloads("fr-FR", None), 0);
    }

    #[tokio::test]
    async fn node_wide_maintenance_covers_every_site() {
        let maintenance = LocalMaintenance::default();
        maintenance.set_maintenance(true, Some("blog")).await.unwrap();
        assert!(maintenance.is_enabled(Some("blog")));
        assert!(!maintenance.is_enabled(Some("shop")));

        maintenance.set_maintenance(true, None).await.unwrap();
        assert!(maintenance.is_enabled(Some("shop")));

        maintenance.set_maintenance(false, None).await.unwrap();
        maintenance.set_maintenance(false, Some("blog")).await.unwrap();
        assert!(!maintenance.is_enabled(Some("blog")));
    }
}
