//! Configuration loading and querying.
//!
//! Configuration is assembled from layered sources (serialized defaults, YAML/JSON files, and prefixed environment
//! variables) using `figment`, and can either be deserialized straight into a typed structure or kept around as a
//! [`GenericConfiguration`] that components query for the keys they care about.
#![deny(warnings)]
#![deny(missing_docs)]

use std::{borrow::Cow, path::Path, sync::Arc};

use figment::{
    error::Kind,
    providers::{Env, Format as _, Json, Serialized, Yaml},
    Figment, Provider,
};
use serde::{Deserialize, Serialize};
use snafu::{ResultExt as _, Snafu};
use tracing::debug;

/// A configuration error.
#[derive(Debug, Snafu)]
#[snafu(context(suffix(false)))]
pub enum ConfigurationError {
    /// Environment variable prefix was empty.
    #[snafu(display("Environment variable prefix must not be empty."))]
    EmptyPrefix,

    /// A configuration file could not be read.
    #[snafu(display("Failed to read configuration file '{}'.", path))]
    ReadFile {
        /// Path of the file.
        path: String,

        /// Error source.
        source: std::io::Error,
    },

    /// Requested field was missing from the configuration.
    #[snafu(display("Missing field '{}' in configuration. {}", field, help_text))]
    MissingField {
        /// Help text describing how to set the missing field.
        help_text: String,

        /// Name of the missing field.
        field: Cow<'static, str>,
    },

    /// Requested field's data type was not the expected data type.
    #[snafu(display(
        "Expected value for field '{}' to be '{}', got '{}' instead.",
        field,
        expected_ty,
        actual_ty
    ))]
    InvalidFieldType {
        /// Period-separated path to the invalid field.
        field: String,

        /// Expected data type.
        expected_ty: String,

        /// Actual data type.
        actual_ty: String,
    },

    /// Generic configuration error.
    #[snafu(display("Failed to query configuration."))]
    Generic {
        /// Error source.
        source: figment::Error,
    },
}

impl ConfigurationError {
    fn from_figment(env_prefix: Option<&str>, e: figment::Error) -> Self {
        match e.kind {
            Kind::MissingField(field) => {
                let mut help_text = format!("Try setting `{}`", field);
                if let Some(prefix) = env_prefix {
                    help_text.push_str(&format!(" or `{}{}`", prefix, field.replace('.', "_").to_uppercase()));
                }
                help_text.push('.');

                Self::MissingField { help_text, field }
            }
            Kind::InvalidType(actual_ty, expected_ty) => Self::InvalidFieldType {
                field: e.path.join("."),
                expected_ty,
                actual_ty: actual_ty.to_string(),
            },
            _ => Self::Generic { source: e },
        }
    }
}

/// A configuration loader that can pull from various sources.
///
/// Sources have an implicit priority based on the order in which they are added: sources added later take precedence
/// over sources added earlier.
///
/// # Supported sources
///
/// - serialized defaults (see [`with_defaults`][Self::with_defaults])
/// - YAML file
/// - JSON file
/// - environment variables (must be prefixed; see [`from_environment`][Self::from_environment])
pub struct ConfigurationLoader {
    figment: Figment,
    env_prefix: Option<String>,
}

impl Default for ConfigurationLoader {
    fn default() -> Self {
        Self {
            figment: Figment::new(),
            env_prefix: None,
        }
    }
}

impl ConfigurationLoader {
    /// Adds the given value as the lowest-priority source, as if it were loaded first.
    pub fn with_defaults<T>(mut self, defaults: T) -> Self
    where
        T: Serialize,
    {
        self.figment = Figment::from(Serialized::defaults(defaults)).admerge(self.figment);
        self
    }

    /// Loads the given YAML configuration file.
    ///
    /// # Errors
    ///
    /// If the file could not be read, or if the file is not valid YAML, an error will be returned.
    pub fn from_yaml<P>(mut self, path: P) -> Result<Self, ConfigurationError>
    where
        P: AsRef<Path>,
    {
        let contents = read_file(path.as_ref())?;
        let provider = Yaml::string(&contents);
        provider.data().context(Generic)?;

        self.figment = self.figment.admerge(provider);
        Ok(self)
    }

    /// Attempts to load the given YAML configuration file, ignoring any errors.
    pub fn try_from_yaml<P>(self, path: P) -> Self
    where
        P: AsRef<Path>,
    {
        let file_path = path.as_ref().to_string_lossy().into_owned();
        let fallback = ConfigurationLoader {
            figment: self.figment.clone(),
            env_prefix: self.env_prefix.clone(),
        };

        match self.from_yaml(path) {
            Ok(loader) => loader,
            Err(e) => {
                debug!(error = %e, file_path, "Unable to read YAML configuration file. Ignoring.");
                fallback
            }
        }
    }

    /// Loads the given JSON configuration file.
    ///
    /// # Errors
    ///
    /// If the file could not be read, or if the file is not valid JSON, an error will be returned.
    pub fn from_json<P>(mut self, path: P) -> Result<Self, ConfigurationError>
    where
        P: AsRef<Path>,
    {
        let contents = read_file(path.as_ref())?;
        let provider = Json::string(&contents);
        provider.data().context(Generic)?;

        self.figment = self.figment.admerge(provider);
        Ok(self)
    }

    /// Loads configuration from environment variables.
    ///
    /// The prefix given will have an underscore appended to it if it does not already end with one. For example, with a
    /// prefix of `tally`, any environment variable starting with `TALLY_` would be matched. The prefix is
    /// case-insensitive.
    ///
    /// # Errors
    ///
    /// If the prefix is empty, an error will be returned.
    pub fn from_environment(mut self, prefix: &str) -> Result<Self, ConfigurationError> {
        if prefix.is_empty() {
            return Err(ConfigurationError::EmptyPrefix);
        }

        let prefix = if prefix.ends_with('_') {
            prefix.to_uppercase()
        } else {
            format!("{}_", prefix.to_uppercase())
        };

        self.figment = self.figment.admerge(Env::prefixed(&prefix));
        self.env_prefix = Some(prefix);
        Ok(self)
    }

    /// Consumes the configuration loader, deserializing it as `T`.
    ///
    /// ## Errors
    ///
    /// If the configuration could not be deserialized into `T`, an error will be returned.
    pub fn into_typed<'a, T>(self) -> Result<T, ConfigurationError>
    where
        T: Deserialize<'a>,
    {
        self.figment
            .extract()
            .map_err(|e| ConfigurationError::from_figment(self.env_prefix.as_deref(), e))
    }

    /// Consumes the configuration loader and wraps it in a generic wrapper.
    pub fn into_generic(self) -> GenericConfiguration {
        GenericConfiguration {
            inner: Arc::new(Inner {
                figment: self.figment,
                env_prefix: self.env_prefix,
            }),
        }
    }
}

fn read_file(path: &Path) -> Result<String, ConfigurationError> {
    std::fs::read_to_string(path).context(ReadFile {
        path: path.to_string_lossy().into_owned(),
    })
}

#[derive(Debug)]
struct Inner {
    figment: Figment,
    env_prefix: Option<String>,
}

/// A generic configuration object.
///
/// This represents the merged configuration derived from [`ConfigurationLoader`] in its raw form. Values can be
/// queried by key, and can be extracted either as typed values or in their raw form.
///
/// Keys must be in the form of `a.b.c`, where periods (`.`) are used to indicate a nested value. Keys that are only
/// present in the environment can be queried with the same notation: `a.b.c` falls back to `a_b_c`.
#[derive(Clone, Debug)]
pub struct GenericConfiguration {
    inner: Arc<Inner>,
}

impl GenericConfiguration {
    /// Creates an empty configuration.
    pub fn empty() -> Self {
        ConfigurationLoader::default().into_generic()
    }

    fn get<'a, T>(&self, key: &str) -> Result<T, ConfigurationError>
    where
        T: Deserialize<'a>,
    {
        let figment = &self.inner.figment;
        match figment.extract_inner(key) {
            Ok(value) => Ok(value),
            Err(e) if matches!(e.kind, Kind::MissingField(_)) && key.contains('.') => figment
                .extract_inner(&key.replace('.', "_"))
                .map_err(|e| self.map_error(e)),
            Err(e) => Err(self.map_error(e)),
        }
    }

    fn map_error(&self, e: figment::Error) -> ConfigurationError {
        ConfigurationError::from_figment(self.inner.env_prefix.as_deref(), e)
    }

    /// Gets a configuration value by key.
    ///
    /// ## Errors
    ///
    /// If the key does not exist in the configuration, or if the value could not be deserialized into `T`, an error
    /// variant will be returned.
    pub fn get_typed<'a, T>(&self, key: &str) -> Result<T, ConfigurationError>
    where
        T: Deserialize<'a>,
    {
        self.get(key)
    }

    /// Gets a configuration value by key, or the default value if a key does not exist or could not be deserialized.
    ///
    /// This swallows any errors and should be used sparingly.
    pub fn get_typed_or_default<'a, T>(&self, key: &str) -> T
    where
        T: Default + Deserialize<'a>,
    {
        self.get(key).unwrap_or_default()
    }

    /// Gets a configuration value by key, if it exists.
    ///
    /// ## Errors
    ///
    /// If the key exists but could not be deserialized into `T`, an error will be returned.
    pub fn try_get_typed<'a, T>(&self, key: &str) -> Result<Option<T>, ConfigurationError>
    where
        T: Deserialize<'a>,
    {
        match self.get(key) {
            Ok(value) => Ok(Some(value)),
            Err(ConfigurationError::MissingField { .. }) => Ok(None),
            Err(e) => Err(e),
        }
    }

    /// Attempts to deserialize the entire configuration as `T`.
    ///
    /// ## Errors
    ///
    /// If the value could not be deserialized into `T`, an error will be returned.
    pub fn as_typed<'a, T>(&self) -> Result<T, ConfigurationError>
    where
        T: Deserialize<'a>,
    {
        self.inner.figment.extract().map_err(|e| self.map_error(e))
    }
}
