use std::time::Duration;

use anyhow::bail;
use convoy_client::Kind;
use convoy_runtime::{ControllerConfig, SweepConfig};
use envconfig::Envconfig;

#[derive(Envconfig, Clone, Debug)]
pub struct ConvoyConfig {
    /// `dev` or `prod`; fills every unset optional below.
    #[envconfig(from = "CONVOY_PROFILE", default = "dev")]
    pub profile: String,

    /// Watch a single namespace instead of the whole cluster.
    #[envconfig(from = "CONVOY_WATCH_NAMESPACE")]
    pub watch_namespace: Option<String>,

    /// File holding the token handed to CI jobs. Required in prod.
    #[envconfig(from = "CONVOY_TOKEN_FILE")]
    pub token_file: Option<String>,

    /// Seed for cluster name suffixes. Unset means OS entropy.
    #[envconfig(from = "CONVOY_SEED")]
    pub seed: Option<u64>,

    /// Provisioning backend for managed clusters (`memory`).
    #[envconfig(from = "CONVOY_PROVISIONER")]
    pub provisioner: Option<String>,

    /// Service child kinds whose changes wake their CiJob, comma-separated
    /// `apiVersion/Kind` (`db.convoy.io/v1/Postgres`). Others are seen on
    /// resync only.
    #[envconfig(from = "CONVOY_SERVICE_KINDS")]
    pub service_kinds: Option<String>,

    #[envconfig(nested)]
    pub engine: EngineConfig,

    #[envconfig(nested)]
    pub sweep: SweepSettings,

    #[envconfig(nested)]
    pub features: FeaturesConfig,
}

#[derive(Envconfig, Clone, Debug, Default)]
pub struct EngineConfig {
    #[envconfig(from = "CONVOY_ENGINE_WORKERS")]
    pub workers: Option<usize>,
    #[envconfig(from = "CONVOY_ENGINE_RESYNC_SECS")]
    pub resync_secs: Option<u64>,
    #[envconfig(from = "CONVOY_ENGINE_BACKOFF_BASE_MS", default = "5")]
    pub backoff_base_ms: u64,
    #[envconfig(from = "CONVOY_ENGINE_BACKOFF_MAX_SECS", default = "300")]
    pub backoff_max_secs: u64,
}

#[derive(Envconfig, Clone, Debug)]
pub struct SweepSettings {
    /// Seconds an object may stay in deletion before its finalizers are
    /// stripped.
    #[envconfig(from = "CONVOY_SWEEP_GRACE_SECS", default = "30")]
    pub grace_secs: u64,
    #[envconfig(from = "CONVOY_SWEEP_TIMEOUT_SECS", default = "60")]
    pub timeout_secs: u64,
    #[envconfig(from = "CONVOY_SWEEP_SYSTEM_NAMESPACE", default = "kube-system")]
    pub system_namespace: String,
}

#[derive(Envconfig, Clone, Debug, Default)]
pub struct FeaturesConfig {
    /// If Some, env explicitly set; otherwise, profile defaults apply
    #[envconfig(from = "CONVOY_FEATURES_CI_JOBS")]
    pub ci_jobs: Option<bool>,
    #[envconfig(from = "CONVOY_FEATURES_CLUSTERS")]
    pub clusters: Option<bool>,
}

impl ConvoyConfig {
    /// Apply profile → defaults mapping, while respecting explicit env overrides.
    ///
    /// - dev: workers=1, resync=10s, ci_jobs=true, clusters=true, provisioner=memory
    /// - prod: workers=4, resync=60s, ci_jobs=true, clusters=false, no provisioner
    pub fn apply_profile_defaults(mut self) -> Self {
        let (def_workers, def_resync, def_ci, def_clusters, def_prov) =
            match self.profile.as_str() {
                "prod" | "production" => (4, 60, true, false, None),
                _ /* dev */ => (1, 10, true, true, Some("memory")),
            };

        if self.engine.workers.is_none() {
            self.engine.workers = Some(def_workers);
        }
        if self.engine.resync_secs.is_none() {
            self.engine.resync_secs = Some(def_resync);
        }
        if self.features.ci_jobs.is_none() {
            self.features.ci_jobs = Some(def_ci);
        }
        if self.features.clusters.is_none() {
            self.features.clusters = Some(def_clusters);
        }
        if self.provisioner.is_none() {
            self.provisioner = def_prov.map(str::to_string);
        }
        self
    }

    pub fn is_dev(&self) -> bool {
        !matches!(self.profile.as_str(), "prod" | "production")
    }

    pub fn workers(&self) -> usize {
        self.engine.workers.unwrap_or(1).max(1)
    }

    /// Engine settings for the controller called `name`.
    pub fn controller(&self, name: &str) -> ControllerConfig {
        ControllerConfig {
            name: name.to_string(),
            namespace: self.watch_namespace.clone(),
            resync: self
                .engine
                .resync_secs
                .filter(|s| *s > 0)
                .map(Duration::from_secs),
            backoff_base: Duration::from_millis(self.engine.backoff_base_ms),
            backoff_max: Duration::from_secs(self.engine.backoff_max_secs),
            ..Default::default()
        }
    }

    pub fn service_kinds(&self) -> anyhow::Result<Vec<Kind>> {
        let Some(raw) = self.service_kinds.as_deref() else {
            return Ok(Vec::new());
        };
        let mut kinds = Vec::new();
        for entry in raw.split(',').map(str::trim).filter(|e| !e.is_empty()) {
            match entry.rsplit_once('/') {
                Some((api_version, kind)) if !api_version.is_empty() && !kind.is_empty() => {
                    kinds.push(Kind::custom(api_version, kind))
                }
                _ => bail!("CONVOY_SERVICE_KINDS entry {entry:?} is not apiVersion/Kind"),
            }
        }
        Ok(kinds)
    }

    pub fn sweep_config(&self) -> SweepConfig {
        SweepConfig {
            grace: Duration::from_secs(self.sweep.grace_secs),
            timeout: Duration::from_secs(self.sweep.timeout_secs),
            system_namespaces: vec![self.sweep.system_namespace.clone()],
            ..Default::default()
        }
    }
}

impl Default for ConvoyConfig {
    /// Dev profile with every default applied; used by tests and the memory
    /// backend.
    fn default() -> Self {
        ConvoyConfig {
            profile: "dev".into(),
            watch_namespace: None,
            token_file: None,
            seed: None,
            provisioner: None,
            service_kinds: None,
            engine: EngineConfig {
                backoff_base_ms: 5,
                backoff_max_secs: 300,
                ..Default::default()
            },
            sweep: SweepSettings {
                grace_secs: 30,
                timeout_secs: 60,
                system_namespace: "kube-system".into(),
            },
            features: FeaturesConfig::default(),
        }
        .apply_profile_defaults()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base(profile: &str) -> ConvoyConfig {
        ConvoyConfig {
            profile: profile.to_string(),
            ..ConvoyConfig::default()
        }
    }

    fn bare(profile: &str) -> ConvoyConfig {
        let mut cfg = base(profile);
        cfg.engine.workers = None;
        cfg.engine.resync_secs = None;
        cfg.features = FeaturesConfig::default();
        cfg.provisioner = None;
        cfg
    }

    #[test]
    fn profile_defaults_dev() {
        let cfg = bare("dev").apply_profile_defaults();
        assert_eq!(cfg.engine.workers, Some(1));
        assert_eq!(cfg.engine.resync_secs, Some(10));
        assert_eq!(cfg.features.ci_jobs, Some(true));
        assert_eq!(cfg.features.clusters, Some(true));
        assert_eq!(cfg.provisioner.as_deref(), Some("memory"));
        assert!(cfg.is_dev());
    }

    #[test]
    fn profile_defaults_prod() {
        for p in ["prod", "production"] {
            let cfg = bare(p).apply_profile_defaults();
            assert_eq!(cfg.engine.workers, Some(4));
            assert_eq!(cfg.engine.resync_secs, Some(60));
            assert_eq!(cfg.features.clusters, Some(false));
            assert_eq!(cfg.provisioner, None);
            assert!(!cfg.is_dev());
        }
    }

    #[test]
    fn profile_defaults_respect_env_overrides() {
        let mut cfg = bare("prod");
        cfg.features.clusters = Some(true);
        cfg.engine.workers = Some(8);
        cfg.provisioner = Some("memory".into());
        let cfg = cfg.apply_profile_defaults();
        assert_eq!(cfg.features.clusters, Some(true));
        assert_eq!(cfg.workers(), 8);
        assert_eq!(cfg.provisioner.as_deref(), Some("memory"));
        // Others get profile defaults
        assert_eq!(cfg.engine.resync_secs, Some(60));
    }

    #[test]
    fn zero_resync_disables_the_timer() {
        let mut cfg = base("dev");
        cfg.engine.resync_secs = Some(0);
        assert_eq!(cfg.controller("ci-jobs").resync, None);
        cfg.engine.resync_secs = Some(15);
        let ctrl = cfg.controller("ci-jobs");
        assert_eq!(ctrl.resync, Some(Duration::from_secs(15)));
        assert_eq!(ctrl.name, "ci-jobs");
    }

    #[test]
    fn service_kinds_parse() {
        let mut cfg = base("dev");
        assert!(cfg.service_kinds().unwrap().is_empty());
        cfg.service_kinds =
            Some("db.convoy.io/v1/Postgres, cache.convoy.io/v1beta1/Redis".into());
        assert_eq!(
            cfg.service_kinds().unwrap(),
            vec![
                Kind::custom("db.convoy.io/v1", "Postgres"),
                Kind::custom("cache.convoy.io/v1beta1", "Redis"),
            ]
        );
        cfg.service_kinds = Some("Postgres".into());
        assert!(cfg.service_kinds().is_err());
    }

    #[test]
    fn sweep_settings_map_to_runtime_config() {
        let mut cfg = base("dev");
        cfg.sweep.grace_secs = 5;
        cfg.sweep.system_namespace = "infra".into();
        let sweep = cfg.sweep_config();
        assert_eq!(sweep.grace, Duration::from_secs(5));
        assert_eq!(sweep.system_namespaces, vec!["infra".to_string()]);
        assert_eq!(sweep.kinds.len(), 7);
    }
}
