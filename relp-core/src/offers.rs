//! Offers: `FEATURENAME ["=" VALUE] LF` lines exchanged in `init`, `go` and their responses.

use std::fmt;

/// Mandatory offer naming the protocol version in use.
pub const RELP_VERSION: &str = "relp_version";
pub const MAX_FEATURE_NAME_LEN: usize = 32;
pub const MAX_FEATURE_VALUE_LEN: usize = 255;

/// A single feature advertisement.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Offer {
    name: String,
    value: Option<String>,
}

impl Offer {
    pub fn new(name: impl Into<String>, value: Option<String>) -> Result<Self, OfferError> {
        let name = name.into();
        if name.is_empty() || name.len() > MAX_FEATURE_NAME_LEN {
            return Err(OfferError::NameLength(name.len()));
        }
        if name.contains(['=', '\n']) {
            return Err(OfferError::InvalidName(name));
        }
        if let Some(v) = &value {
            if v.len() > MAX_FEATURE_VALUE_LEN {
                return Err(OfferError::ValueLength {
                    name,
                    len: v.len(),
                });
            }
            if v.contains('\n') {
                return Err(OfferError::InvalidValue(name));
            }
        }
        Ok(Self { name, value })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn value(&self) -> Option<&str> {
        self.value.as_deref()
    }
}

impl fmt::Display for Offer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.value {
            Some(v) => write!(f, "{}={}", self.name, v),
            None => f.write_str(&self.name),
        }
    }
}

/// Ordered offer list, unique by feature name. Encoding preserves insertion order.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Offers {
    entries: Vec<Offer>,
}

impl Offers {
    pub fn new() -> Self {
        Self::default()
    }

    /// Offers a peer running this implementation advertises by default.
    pub fn with_version(version: u32) -> Self {
        let mut offers = Self::new();
        offers.insert(Offer {
            name: RELP_VERSION.to_string(),
            value: Some(version.to_string()),
        });
        offers
    }

    /// Insert or replace an offer by name.
    pub fn insert(&mut self, offer: Offer) {
        match self.entries.iter_mut().find(|o| o.name == offer.name) {
            Some(existing) => *existing = offer,
            None => self.entries.push(offer),
        }
    }

    pub fn get(&self, name: &str) -> Option<&Offer> {
        self.entries.iter().find(|o| o.name == name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.get(name).is_some()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Offer> {
        self.entries.iter()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Value of the `relp_version` offer, if present and numeric.
    pub fn relp_version(&self) -> Option<u32> {
        self.get(RELP_VERSION)?.value()?.parse().ok()
    }

    /// Parse offer lines. Every line must be LF-terminated; a duplicate name replaces the earlier one.
    pub fn parse(data: &[u8]) -> Result<Self, OfferError> {
        let mut offers = Self::new();
        let mut rest = data;
        while !rest.is_empty() {
            let Some(end) = rest.iter().position(|&b| b == b'\n') else {
                return Err(OfferError::Unterminated);
            };
            let line = std::str::from_utf8(&rest[..end]).map_err(|_| OfferError::Encoding)?;
            rest = &rest[end + 1..];
            if line.is_empty() {
                continue;
            }
            let offer = match line.split_once('=') {
                Some((name, value)) => Offer::new(name, Some(value.to_string()))?,
                None => Offer::new(line, None)?,
            };
            offers.insert(offer);
        }
        Ok(offers)
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::new();
        self.encode_into(&mut out);
        out
    }

    pub fn encode_into(&self, out: &mut Vec<u8>) {
        for offer in &self.entries {
            out.extend_from_slice(offer.to_string().as_bytes());
            out.push(b'\n');
        }
    }
}

impl<'a> IntoIterator for &'a Offers {
    type Item = &'a Offer;
    type IntoIter = std::slice::Iter<'a, Offer>;

    fn into_iter(self) -> Self::IntoIter {
        self.entries.iter()
    }
}

/// Error parsing or building offers.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum OfferError {
    #[error("feature name length {0} outside 1..=32")]
    NameLength(usize),
    #[error("invalid feature name {0:?}")]
    InvalidName(String),
    #[error("value of feature {name} is {len} octets, limit is 255")]
    ValueLength { name: String, len: usize },
    #[error("value of feature {0} contains LF")]
    InvalidValue(String),
    #[error("offer line not terminated by LF")]
    Unterminated,
    #[error("offer is not valid UTF-8")]
    Encoding,
}
