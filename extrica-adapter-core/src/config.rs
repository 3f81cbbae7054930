use std::{collections::HashMap, fs::File, path::PathBuf};

use serde::Deserialize;
use snafu::{OptionExt, ResultExt, Snafu};
use tracing::instrument;

use crate::credentials::{self, Credentials};

#[derive(Snafu, Debug)]
pub enum Error {
    #[snafu(display("Failed to read profiles file at {profiles_file:?}"))]
    ReadProfilesFile {
        source: std::io::Error,
        profiles_file: PathBuf,
    },

    #[snafu(display("Failed to parse profiles file at {profiles_file:?}"))]
    ParseProfilesFile {
        source: serde_yaml::Error,
        profiles_file: PathBuf,
    },

    #[snafu(display("The profile {profile:?} does not exist"))]
    ProfileNotFound { profile: String },

    #[snafu(display(
        "The profiles file contains {count} profiles, please select the one to use"
    ))]
    AmbiguousProfile { count: usize },

    #[snafu(display("The profile {profile:?} has no output called {target:?}"))]
    TargetNotFound { profile: String, target: String },

    #[snafu(display("Invalid credentials for target {target:?} of profile {profile:?}"))]
    ResolveCredentials {
        source: credentials::Error,
        profile: String,
        target: String,
    },
}

/// The content of a profiles file, which maps profile names to their targets.
#[derive(Clone, Debug, Deserialize)]
#[serde(transparent)]
pub struct ProfilesConfig {
    pub profiles: HashMap<String, Profile>,
}

#[derive(Clone, Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Profile {
    /// The output used when no target is selected explicitly.
    pub target: String,

    /// The raw connection parameters of every target. They are only validated once a
    /// target is selected, so that a broken target does not break the others.
    pub outputs: HashMap<String, serde_yaml::Value>,
}

impl ProfilesConfig {
    /// Using [`std::fs::File`] is fine, as the profiles are only read once during startup.
    pub fn read_from_file(profiles_file: &PathBuf) -> Result<Self, Error> {
        let profiles_file_content =
            File::open(profiles_file).context(ReadProfilesFileSnafu { profiles_file })?;

        serde_yaml::from_reader(profiles_file_content)
            .context(ParseProfilesFileSnafu { profiles_file })
    }

    /// Resolves the credentials of the selected target.
    ///
    /// Without a `profile` the file must contain exactly one profile, without a `target`
    /// the profile's default target is used.
    #[instrument(skip(self))]
    pub fn target_credentials(
        &self,
        profile: Option<&str>,
        target: Option<&str>,
    ) -> Result<Credentials, Error> {
        let (profile_name, profile) = match profile {
            Some(profile_name) => self
                .profiles
                .get_key_value(profile_name)
                .context(ProfileNotFoundSnafu {
                    profile: profile_name,
                })?,
            None => {
                let mut profiles = self.profiles.iter();
                match (profiles.next(), profiles.next()) {
                    (Some(only), None) => only,
                    _ => AmbiguousProfileSnafu {
                        count: self.profiles.len(),
                    }
                    .fail()?,
                }
            }
        };

        let target = target.unwrap_or(&profile.target);
        let raw = profile
            .outputs
            .get(target)
            .context(TargetNotFoundSnafu {
                profile: profile_name,
                target,
            })?
            .clone();

        Credentials::resolve(raw).context(ResolveCredentialsSnafu {
            profile: profile_name,
            target,
        })
    }
}
