//! Deep Learning AMI lookup.
//!
//! Images are named `Deep Learning AMI (<distro>) Version <n>`. Asking for
//! `latest` picks the highest numeric version in the catalog; any other
//! version string is matched as a name prefix and the first hit wins.

use std::fmt;
use std::str::FromStr;

use serde::Deserialize;

use crate::error::{ClusterError, Result};


pub const LATEST: &str = "latest";


/// Distribution flavour of the Deep Learning AMI.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ImageType {
    Ubuntu,
    AmazonLinux,
}

impl ImageType {
    /// Name as it appears inside the AMI name.
    pub fn search_name(&self) -> &'static str {
        match self {
            ImageType::Ubuntu => "Ubuntu",
            ImageType::AmazonLinux => "Amazon Linux",
        }
    }

    /// Key used for this image type in the template's `Mappings`.
    pub fn mapping_key(&self) -> &'static str {
        match self {
            ImageType::Ubuntu => "Ubuntu",
            ImageType::AmazonLinux => "AmazonLinux",
        }
    }
}

impl FromStr for ImageType {
    type Err = ClusterError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "ubuntu" => Ok(ImageType::Ubuntu),
            "amazonlinux" | "amazon linux" => Ok(ImageType::AmazonLinux),
            other => Err(ClusterError::Config(format!("unknown image type '{}'", other))),
        }
    }
}

impl fmt::Display for ImageType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.mapping_key())
    }
}


/// One entry of the provider's image catalog.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct ImageRecord {
    pub name: String,
    pub image_id: String,
}


/// Anything that can list public images by name prefix.
pub trait ImageCatalog {
    fn describe_images(&self, name_prefix: &str) -> Result<Vec<ImageRecord>>;
}


/// Name prefix to search for. For a pinned version the version is part of
/// the prefix.
pub fn search_prefix(image_type: ImageType, version: &str) -> String {
    let mut prefix = format!("Deep Learning AMI ({}) Version ", image_type.search_name());
    if version != LATEST {
        prefix.push_str(version);
    }
    prefix
}

/// Parse `"21.2"` into `[21, 2]` for ordering.
fn parse_version(v: &str) -> Option<Vec<u32>> {
    let v = v.trim();
    if v.is_empty() {
        return None;
    }
    v.split('.').map(|part| part.parse::<u32>().ok()).collect()
}

/// Pick the image for `version` out of `images`.
pub fn select_image<'a>(
    images: &'a [ImageRecord],
    image_type: ImageType,
    version: &str,
) -> Result<&'a ImageRecord> {
    let not_found = || ClusterError::Provider {
        operation: "describe-images".into(),
        detail: format!("no Deep Learning AMI ({}) version {}", image_type.search_name(), version),
    };

    if version != LATEST {
        let prefix = search_prefix(image_type, version);
        return images.iter().find(|i| i.name.starts_with(&prefix)).ok_or_else(not_found);
    }

    let base = search_prefix(image_type, LATEST);
    images
        .iter()
        .filter_map(|image| {
            let ver = image.name.strip_prefix(&base).and_then(parse_version)?;
            Some((ver, image))
        })
        .max_by(|a, b| a.0.cmp(&b.0))
        .map(|(_, image)| image)
        .ok_or_else(not_found)
}

/// Query `catalog` and return the AMI id for `image_type` / `version`.
pub fn lookup_dlami(catalog: &dyn ImageCatalog, image_type: ImageType, version: &str) -> Result<String> {
    let images = catalog.describe_images(&search_prefix(image_type, version))?;
    Ok(select_image(&images, image_type, version)?.image_id.clone())
}
