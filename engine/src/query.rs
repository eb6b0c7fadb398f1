//! Query parameters and canonical cache keys.
//!
//! The read cache only hits if the same logical query always maps to the
//! same key. Two requests are the same logical query when they differ only
//! in parameter order, in whitespace around values, in filters that are
//! absent on one side and empty on the other, or in spelling out a default
//! (first page, default page size, ascending sort) versus omitting it.

use crate::{error::Result, CacheKey, Error};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt::Write;

/// Page size assumed when a query does not name one.
pub const DEFAULT_PER_PAGE: u32 = 25;

/// Version tag at the front of every key, bumped if the format changes.
const KEY_FORMAT: &str = "q1";

/// Sort direction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SortDirection {
    #[default]
    Asc,
    Desc,
}

impl SortDirection {
    pub fn as_str(&self) -> &'static str {
        match self {
            SortDirection::Asc => "asc",
            SortDirection::Desc => "desc",
        }
    }

    fn parse(raw: &str) -> Result<Option<Self>> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "" => Ok(None),
            "asc" | "ascending" => Ok(Some(SortDirection::Asc)),
            "desc" | "descending" => Ok(Some(SortDirection::Desc)),
            other => Err(Error::InvalidQuery(format!("unknown sort direction: {other}"))),
        }
    }
}

/// Sort field and direction.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SortSpec {
    pub field: String,
    #[serde(default)]
    pub direction: SortDirection,
}

/// Filter, sort and pagination parameters of one read.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueryParams {
    /// The listing being queried (e.g. "invoices")
    pub resource: String,
    /// Filter name to value
    #[serde(default)]
    pub filters: BTreeMap<String, String>,
    #[serde(default)]
    pub sort: Option<SortSpec>,
    /// 1-based page number
    #[serde(default)]
    pub page: Option<u32>,
    #[serde(default)]
    pub per_page: Option<u32>,
}

impl QueryParams {
    pub fn new(resource: impl Into<String>) -> Self {
        Self {
            resource: resource.into(),
            ..Self::default()
        }
    }

    /// Builder-style method to set a filter. A later value for the same
    /// name replaces the earlier one.
    pub fn filter(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.filters.insert(name.into(), value.into());
        self
    }

    pub fn sort_by(mut self, field: impl Into<String>, direction: SortDirection) -> Self {
        self.sort = Some(SortSpec {
            field: field.into(),
            direction,
        });
        self
    }

    pub fn page(mut self, page: u32) -> Self {
        self.page = Some(page);
        self
    }

    pub fn per_page(mut self, per_page: u32) -> Self {
        self.per_page = Some(per_page);
        self
    }

    /// Parse raw request pairs.
    ///
    /// `sort`, `dir` (or `order`), `page` and `per_page` (or `perPage`) are
    /// control parameters; everything else is a filter. Empty control values
    /// mean "not given". A name given twice, counting aliases, is rejected
    /// so that pair order can never change the resulting key.
    pub fn from_pairs<I, K, V>(resource: impl Into<String>, pairs: I) -> Result<Self>
    where
        I: IntoIterator<Item = (K, V)>,
        K: AsRef<str>,
        V: AsRef<str>,
    {
        let mut params = Self::new(resource);
        let mut sort_field: Option<String> = None;
        let mut direction: Option<SortDirection> = None;
        let mut seen = BTreeSet::new();

        for (name, value) in pairs {
            let (name, value) = (name.as_ref().trim(), value.as_ref());
            let slot = match name {
                "order" => "dir",
                "perPage" => "per_page",
                other => other,
            };
            if !seen.insert(slot.to_string()) {
                return Err(Error::InvalidQuery(format!("parameter `{slot}` given more than once")));
            }
            match name {
                "sort" => sort_field = Some(value.to_string()),
                "dir" | "order" => direction = SortDirection::parse(value)?,
                "page" => params.page = parse_number(name, value)?,
                "per_page" | "perPage" => params.per_page = parse_number(name, value)?,
                _ => {
                    params.filters.insert(name.to_string(), value.to_string());
                }
            }
        }

        if let Some(field) = sort_field {
            params.sort = Some(SortSpec {
                field,
                direction: direction.unwrap_or_default(),
            });
        }

        Ok(params)
    }

    /// The normalized form of this query: trimmed, defaults filled in,
    /// empty filters and empty sort removed.
    pub fn canonical(&self) -> Self {
        let filters = self
            .filters
            .iter()
            .map(|(k, v)| (k.trim(), v.trim()))
            .filter(|(k, v)| !k.is_empty() && !v.is_empty())
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();

        let sort = self.sort.as_ref().and_then(|s| {
            let field = s.field.trim();
            (!field.is_empty()).then(|| SortSpec {
                field: field.to_string(),
                direction: s.direction,
            })
        });

        Self {
            resource: self.resource.trim().to_string(),
            filters,
            sort,
            page: Some(self.page.filter(|p| *p > 0).unwrap_or(1)),
            per_page: Some(self.per_page.filter(|n| *n > 0).unwrap_or(DEFAULT_PER_PAGE)),
        }
    }

    /// Canonical request pairs, in a stable order, for the query endpoint.
    pub fn to_pairs(&self) -> Vec<(String, String)> {
        let canonical = self.canonical();
        let mut pairs: Vec<(String, String)> = canonical.filters.into_iter().collect();
        if let Some(sort) = canonical.sort {
            pairs.push(("sort".into(), sort.field));
            pairs.push(("dir".into(), sort.direction.as_str().into()));
        }
        pairs.push(("page".into(), canonical.page.unwrap_or(1).to_string()));
        pairs.push((
            "per_page".into(),
            canonical.per_page.unwrap_or(DEFAULT_PER_PAGE).to_string(),
        ));
        pairs
    }
}

fn parse_number(name: &str, raw: &str) -> Result<Option<u32>> {
    let raw = raw.trim();
    if raw.is_empty() {
        return Ok(None);
    }
    raw.parse()
        .map(Some)
        .map_err(|_| Error::InvalidQuery(format!("{name} must be a non-negative integer, got '{raw}'")))
}

/// Derive the cache key of a query.
///
/// Pure: the key depends only on the canonical form of `params`.
/// Layout: `q1|{resource}|{name=value&...}|{field:dir}|{page}|{per_page}`,
/// with reserved characters in names and values percent-escaped.
pub fn key_for(params: &QueryParams) -> CacheKey {
    let canonical = params.canonical();
    let mut key = String::with_capacity(64);

    key.push_str(KEY_FORMAT);
    key.push('|');
    escape_into(&mut key, &canonical.resource);
    key.push('|');
    for (i, (name, value)) in canonical.filters.iter().enumerate() {
        if i > 0 {
            key.push('&');
        }
        escape_into(&mut key, name);
        key.push('=');
        escape_into(&mut key, value);
    }
    key.push('|');
    if let Some(sort) = &canonical.sort {
        escape_into(&mut key, &sort.field);
        key.push(':');
        key.push_str(sort.direction.as_str());
    }
    // canonical() always fills page and per_page
    let _ = write!(
        key,
        "|{}|{}",
        canonical.page.unwrap_or(1),
        canonical.per_page.unwrap_or(DEFAULT_PER_PAGE)
    );
    key
}

fn escape_into(out: &mut String, raw: &str) {
    for c in raw.chars() {
        match c {
            '%' | '|' | '&' | '=' | ':' => {
                let _ = write!(out, "%{:02X}", c as u32);
            }
            _ => out.push(c),
        }
    }
}
