use std::{collections::BTreeMap, env, fs, io::ErrorKind, path::Path};

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use serde_yaml::Value as YamlValue;

use crate::objects::{metrics::K8sMetricSpec, target::TargetRef};

/// Environment variable naming the config file.
pub const CONFIG_PATH_ENV: &str = "configPath";
pub const DEFAULT_CONFIG_PATH: &str = "/config.yaml";

/// Every key that may be overridden by an environment variable of the
/// same name. Scalar values override directly; structured values are
/// parsed as embedded YAML or JSON.
const OVERRIDABLE_KEYS: &[&str] = &[
    "interval",
    "namespace",
    "minReplicas",
    "maxReplicas",
    "runMode",
    "logVerbosity",
    "downscaleStabilization",
    "scaleTargetRef",
    "apiConfig",
    "metric",
    "evaluate",
    "preMetric",
    "postMetric",
    "preEvaluate",
    "postEvaluate",
    "preScale",
    "postScale",
    "kubernetesMetricSpecs",
    "requireKubernetesMetrics",
    "startTime",
    "initialReadinessDelay",
    "cpuInitializationPeriod",
];

/// The autoscaler's configuration, immutable after load.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct Config {
    /// Milliseconds between ticks.
    #[serde(default = "default_interval")]
    pub interval: u64,
    /// Milliseconds; the first tick aligns to the next multiple of this
    /// after process start.
    #[serde(default = "default_start_time")]
    pub start_time: u64,
    /// Zero disables autoscaling for the target.
    #[serde(default = "default_min_replicas")]
    pub min_replicas: i32,
    #[serde(default = "default_max_replicas")]
    pub max_replicas: i32,
    #[serde(default = "default_namespace")]
    pub namespace: String,
    #[serde(default)]
    pub run_mode: RunMode,
    /// Seconds; size of the recent-target window damping downscales.
    #[serde(default)]
    pub downscale_stabilization: u64,
    /// 0 info, 1 debug, 2 and up trace.
    #[serde(default)]
    pub log_verbosity: u32,
    /// Seconds after pod start during which CPU samples are treated as
    /// start-up noise.
    #[serde(default = "default_cpu_initialization_period")]
    pub cpu_initialization_period: u64,
    /// Seconds within which a pod may still flip to ready for the first
    /// time without being counted against it.
    #[serde(default = "default_initial_readiness_delay")]
    pub initial_readiness_delay: u64,
    #[serde(default)]
    pub require_kubernetes_metrics: bool,
    #[serde(default)]
    pub api_config: ApiConfig,
    #[serde(default)]
    pub scale_target_ref: Option<TargetRef>,
    #[serde(default)]
    pub metric: Option<Method>,
    #[serde(default)]
    pub evaluate: Option<Method>,
    #[serde(default)]
    pub pre_metric: Option<Method>,
    #[serde(default)]
    pub post_metric: Option<Method>,
    #[serde(default)]
    pub pre_evaluate: Option<Method>,
    #[serde(default)]
    pub post_evaluate: Option<Method>,
    #[serde(default)]
    pub pre_scale: Option<Method>,
    #[serde(default)]
    pub post_scale: Option<Method>,
    #[serde(default)]
    pub kubernetes_metric_specs: Vec<K8sMetricSpec>,
}

fn default_interval() -> u64 {
    15000
}

fn default_start_time() -> u64 {
    1
}

fn default_min_replicas() -> i32 {
    1
}

fn default_max_replicas() -> i32 {
    10
}

fn default_namespace() -> String {
    "default".to_owned()
}

fn default_cpu_initialization_period() -> u64 {
    300
}

fn default_initial_readiness_delay() -> u64 {
    30
}

impl Default for Config {
    fn default() -> Self {
        serde_yaml::from_str("{}").unwrap()
    }
}

#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub enum RunMode {
    /// Invoke the metric method once per pod matched by the target's
    /// selector.
    PerPod,
    /// Invoke the metric method once, for the target as a whole.
    PerResource,
}

impl Default for RunMode {
    fn default() -> Self {
        RunMode::PerPod
    }
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct ApiConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(rename = "useHTTPS", default)]
    pub use_https: bool,
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default)]
    pub cert_file: String,
    #[serde(default)]
    pub key_file: String,
}

fn default_true() -> bool {
    true
}

fn default_host() -> String {
    "0.0.0.0".to_owned()
}

fn default_port() -> u16 {
    5000
}

impl Default for ApiConfig {
    fn default() -> Self {
        serde_yaml::from_str("{}").unwrap()
    }
}

/// A user-supplied method: either a subprocess fed over stdin or an
/// HTTP endpoint.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct Method {
    #[serde(rename = "type")]
    pub type_: MethodType,
    /// Per-call deadline in milliseconds.
    #[serde(default = "default_timeout")]
    pub timeout: u64,
    #[serde(default)]
    pub shell: Option<Shell>,
    #[serde(default)]
    pub http: Option<Http>,
}

fn default_timeout() -> u64 {
    5000
}

#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum MethodType {
    Shell,
    Http,
}

impl Method {
    pub fn validate(&self, name: &str) -> Result<()> {
        match self.type_ {
            MethodType::Shell if self.shell.is_none() => {
                bail!("{} method is of type shell but has no shell block", name)
            },
            MethodType::Http => match &self.http {
                None => bail!("{} method is of type http but has no http block", name),
                Some(http) if http.success_codes.is_empty() => {
                    bail!("{} method has no success codes", name)
                },
                Some(_) => Ok(()),
            },
            _ => Ok(()),
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct Shell {
    /// Program to launch; the payload arrives on its standard input.
    pub entrypoint: String,
    #[serde(default)]
    pub command: Vec<String>,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct Http {
    pub method: String,
    pub url: String,
    #[serde(default)]
    pub headers: BTreeMap<String, String>,
    pub success_codes: Vec<u16>,
    pub parameter_mode: ParameterMode,
    /// PEM file added to the transport's trust pool.
    #[serde(default)]
    pub ca_cert: Option<String>,
    /// PEM client identity, paired with `clientKey`.
    #[serde(default)]
    pub client_cert: Option<String>,
    #[serde(default)]
    pub client_key: Option<String>,
}

#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ParameterMode {
    /// Payload sent as the request body.
    Body,
    /// Payload sent url-encoded as the `value` query parameter.
    Query,
}

impl Config {
    /// The namespace the target lives in: the reference's own when set,
    /// otherwise the top-level `namespace` key.
    pub fn target_namespace(&self) -> &str {
        self.scale_target_ref
            .as_ref()
            .and_then(|target| target.namespace.as_deref())
            .unwrap_or(&self.namespace)
    }

    /// Load configuration from `path`, then apply environment overrides.
    /// A missing file is fine (env-only configuration); anything else
    /// that goes wrong is fatal.
    pub fn load(path: &Path) -> Result<Config> {
        let mut root = match fs::read_to_string(path) {
            Ok(contents) => serde_yaml::from_str::<YamlValue>(&contents)
                .with_context(|| format!("invalid config file {}", path.display()))?,
            Err(error) if error.kind() == ErrorKind::NotFound => YamlValue::Null,
            Err(error) => {
                return Err(error)
                    .with_context(|| format!("failed to read config file {}", path.display()))
            },
        };
        if root.is_null() {
            root = YamlValue::Mapping(serde_yaml::Mapping::new());
        }
        let mapping = match root {
            YamlValue::Mapping(ref mut mapping) => mapping,
            _ => bail!("config file {} is not a mapping", path.display()),
        };

        for key in OVERRIDABLE_KEYS {
            if let Ok(raw) = env::var(key) {
                let value = serde_yaml::from_str::<YamlValue>(&raw)
                    .with_context(|| format!("invalid override for {}: {:?}", key, raw))?;
                mapping.insert(YamlValue::String((*key).to_owned()), value);
            }
        }

        let config: Config =
            serde_yaml::from_value(root).context("invalid configuration")?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<()> {
        if self.scale_target_ref.is_none() {
            bail!("no scaleTargetRef configured");
        }
        if self.max_replicas < self.min_replicas {
            bail!(
                "maxReplicas ({}) must not be below minReplicas ({})",
                self.max_replicas,
                self.min_replicas
            );
        }
        match &self.metric {
            Some(method) => method.validate("metric")?,
            None => bail!("no metric method configured"),
        }
        match &self.evaluate {
            Some(method) => method.validate("evaluate")?,
            None => bail!("no evaluate method configured"),
        }
        let hooks = [
            ("preMetric", &self.pre_metric),
            ("postMetric", &self.post_metric),
            ("preEvaluate", &self.pre_evaluate),
            ("postEvaluate", &self.post_evaluate),
            ("preScale", &self.pre_scale),
            ("postScale", &self.post_scale),
        ];
        for (name, hook) in hooks {
            if let Some(method) = hook {
                method.validate(name)?;
            }
        }
        for spec in &self.kubernetes_metric_specs {
            spec.validate()?;
        }
        Ok(())
    }
}
