//! Client-side browse layer: consistent placeholder images, list filtering,
//! pagination and favorite membership.
//!
//! Everything here is pure and synchronous; page controllers call it after the
//! backend data is in memory.

use std::cmp::Ordering;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use rand::seq::SliceRandom;
use thiserror::Error;
use tracing::warn;
use unicode_normalization::char::is_combining_mark;
use unicode_normalization::UnicodeNormalization;
use vhub_core::{
    FavoriteEntry, Foundation, FoundationFilter, FoundationSort, ItemType, Opportunity,
    OpportunityFilter,
};

pub const CRATE_NAME: &str = "vhub-browse";

/// Returned for image kinds the resolver does not know.
pub const FALLBACK_IMAGE: &str = "/images/default-enterprise.png";

pub const DEFAULT_PAGE_SIZE: usize = 9;
pub const DEFAULT_MAX_VISIBLE_PAGES: usize = 5;

// ---------------------------------------------------------------------------
// Images
// ---------------------------------------------------------------------------

const FOUNDATION_IMAGES: &[&str] = &[
    "/images/default-enterprise.png",
    "/images/Fundation1.jpg",
    "/images/Fundation2.jpg",
    "/images/Fundation3.jpg",
    "/images/Fundation4.jpg",
    "/images/Fundation5.jpg",
    "/images/Fundation6.jpg",
];

const OPPORTUNITY_IMAGES: &[&str] = &[
    "/images/voluntariado_default.png",
    "/images/Voluntareado1.jpg",
    "/images/Voluntareado2.jpg",
    "/images/Voluntareado3.jpg",
    "/images/Voluntareado4.jpg",
];

const HERO_IMAGES: &[&str] = &["/images/hero.jpg", "/images/hero2.jpg"];
const PROFILE_IMAGES: &[&str] = &["/images/default-profile.png"];
const DONATION_IMAGES: &[&str] = &[
    "/images/donacion_default.png",
    "/images/donaciones-1.avif",
    "/images/donaciones-2.jpg",
];
const ABOUT_IMAGES: &[&str] = &["/images/Sobre-noosotro-1.jpg", "/images/Sobre-Nosotros-2.webp"];
const VISION_IMAGES: &[&str] = &["/images/vision.jpg", "/images/vision-2.webp"];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ImageKind {
    Foundations,
    Opportunities,
    Hero,
    Profile,
    Donations,
    About,
    Vision,
}

impl ImageKind {
    pub fn images(self) -> &'static [&'static str] {
        match self {
            Self::Foundations => FOUNDATION_IMAGES,
            Self::Opportunities => OPPORTUNITY_IMAGES,
            Self::Hero => HERO_IMAGES,
            Self::Profile => PROFILE_IMAGES,
            Self::Donations => DONATION_IMAGES,
            Self::About => ABOUT_IMAGES,
            Self::Vision => VISION_IMAGES,
        }
    }
}

impl From<ItemType> for ImageKind {
    fn from(item_type: ItemType) -> Self {
        match item_type {
            ItemType::Foundation => Self::Foundations,
            ItemType::Opportunity => Self::Opportunities,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("unknown image kind {0:?}")]
pub struct UnknownImageKind(pub String);

impl FromStr for ImageKind {
    type Err = UnknownImageKind;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "foundations" => Ok(Self::Foundations),
            "opportunities" => Ok(Self::Opportunities),
            "hero" => Ok(Self::Hero),
            "profile" => Ok(Self::Profile),
            "donations" => Ok(Self::Donations),
            "about" => Ok(Self::About),
            "vision" => Ok(Self::Vision),
            other => Err(UnknownImageKind(other.to_string())),
        }
    }
}

/// 31-multiplier rolling hash over UTF-16 code units, wrapping at 32 bits.
pub fn identity_hash(id: &str) -> i32 {
    id.encode_utf16()
        .fold(0i32, |hash, unit| hash.wrapping_mul(31).wrapping_add(i32::from(unit)))
}

/// Placeholder image picked from the entity's identity. Same kind and id always
/// give the same image.
pub fn consistent_image(kind: ImageKind, id: &str) -> &'static str {
    let images = kind.images();
    let index = identity_hash(id).unsigned_abs() as usize % images.len();
    images[index]
}

/// String-keyed variant used where the kind comes from untyped input.
pub fn consistent_image_for(kind: &str, id: &str) -> &'static str {
    match kind.parse::<ImageKind>() {
        Ok(kind) => consistent_image(kind, id),
        Err(err) => {
            warn!(%err, "falling back to default image");
            FALLBACK_IMAGE
        }
    }
}

/// Backend-supplied image when non-blank, otherwise the consistent placeholder.
pub fn image_with_fallback<'a>(image_url: Option<&'a str>, kind: ImageKind, id: &str) -> &'a str {
    match image_url {
        Some(url) if !url.trim().is_empty() => url,
        _ => consistent_image(kind, id),
    }
}

pub fn default_image(kind: ImageKind, index: usize) -> &'static str {
    let images = kind.images();
    images[index.min(images.len() - 1)]
}

/// Decorative images with no identity binding; order changes between calls.
pub fn random_images(kind: ImageKind, count: usize) -> Vec<&'static str> {
    let mut shuffled = kind.images().to_vec();
    shuffled.shuffle(&mut rand::thread_rng());
    shuffled.iter().copied().cycle().take(count).collect()
}

pub fn foundation_image(foundation: &Foundation) -> &str {
    image_with_fallback(
        foundation.image_url.as_deref(),
        ImageKind::Foundations,
        &foundation.id,
    )
}

pub fn opportunity_image(opportunity: &Opportunity) -> &str {
    image_with_fallback(
        opportunity.image_url.as_deref(),
        ImageKind::Opportunities,
        &opportunity.id,
    )
}

// ---------------------------------------------------------------------------
// Filtering
// ---------------------------------------------------------------------------

fn needle(raw: &str) -> Option<String> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        None
    } else {
        Some(trimmed.to_lowercase())
    }
}

fn contains_ci(haystack: Option<&str>, needle: &str) -> bool {
    haystack.is_some_and(|h| h.to_lowercase().contains(needle))
}

/// Accent- and case-insensitive key used for name ordering.
pub fn collation_key(value: &str) -> String {
    value
        .nfd()
        .filter(|c| !is_combining_mark(*c))
        .flat_map(char::to_lowercase)
        .collect()
}

fn created_desc(a: &Foundation, b: &Foundation) -> Ordering {
    match (a.created_at, b.created_at) {
        (Some(x), Some(y)) => y.cmp(&x),
        (Some(_), None) => Ordering::Less,
        (None, Some(_)) => Ordering::Greater,
        (None, None) => Ordering::Equal,
    }
}

fn created_asc(a: &Foundation, b: &Foundation) -> Ordering {
    match (a.created_at, b.created_at) {
        (Some(x), Some(y)) => x.cmp(&y),
        (Some(_), None) => Ordering::Less,
        (None, Some(_)) => Ordering::Greater,
        (None, None) => Ordering::Equal,
    }
}

pub fn sort_foundations(items: &mut [Foundation], sort_by: FoundationSort) {
    match sort_by {
        FoundationSort::Name => {
            items.sort_by_cached_key(|f| (collation_key(&f.legal_name), f.legal_name.clone()))
        }
        FoundationSort::Newest => items.sort_by(created_desc),
        FoundationSort::Oldest => items.sort_by(created_asc),
    }
}

/// Foundations matching every set field of `filter`, in `filter.sort_by` order.
/// The input is left untouched.
pub fn filter_foundations(all: &[Foundation], filter: &FoundationFilter) -> Vec<Foundation> {
    let search = needle(&filter.search);
    let location = needle(&filter.location);

    let mut out = all
        .iter()
        .filter(|f| {
            search.as_deref().map_or(true, |n| {
                contains_ci(Some(&f.legal_name), n) || contains_ci(f.address.as_deref(), n)
            })
        })
        .filter(|f| {
            location
                .as_deref()
                .map_or(true, |n| contains_ci(f.address.as_deref(), n))
        })
        .cloned()
        .collect::<Vec<_>>();

    sort_foundations(&mut out, filter.sort_by);
    out
}

/// Opportunities matching `filter`, with status evaluated against the current time.
pub fn filter_opportunities(all: &[Opportunity], filter: &OpportunityFilter) -> Vec<Opportunity> {
    filter_opportunities_at(all, filter, Utc::now())
}

pub fn filter_opportunities_at(
    all: &[Opportunity],
    filter: &OpportunityFilter,
    now: DateTime<Utc>,
) -> Vec<Opportunity> {
    let search = needle(&filter.search);
    let location = needle(&filter.location);

    all.iter()
        .filter(|o| {
            search.as_deref().map_or(true, |n| {
                contains_ci(o.description.as_deref(), n)
                    || contains_ci(o.title.as_deref(), n)
                    || contains_ci(o.foundation.as_ref().map(|f| f.legal_name.as_str()), n)
            })
        })
        .filter(|o| filter.status.map_or(true, |s| o.status_at(now) == s))
        .filter(|o| {
            location.as_deref().map_or(true, |n| {
                contains_ci(o.location.as_deref(), n)
                    || contains_ci(o.foundation.as_ref().and_then(|f| f.address.as_deref()), n)
            })
        })
        .filter(|o| {
            filter
                .start_date
                .map_or(true, |from| o.start_date.date_naive() >= from)
        })
        .filter(|o| {
            filter
                .end_date
                .map_or(true, |to| o.end_date.date_naive() <= to)
        })
        .cloned()
        .collect()
}

// ---------------------------------------------------------------------------
// Pagination
// ---------------------------------------------------------------------------

pub fn total_pages(count: usize, page_size: usize) -> usize {
    if page_size == 0 {
        0
    } else {
        count.div_ceil(page_size)
    }
}

/// Items of 1-based `page`. Out-of-range pages give an empty slice.
pub fn paginate<T>(items: &[T], page: usize, page_size: usize) -> &[T] {
    if page == 0 || page_size == 0 {
        return &[];
    }
    let start = (page - 1).saturating_mul(page_size).min(items.len());
    let end = page.saturating_mul(page_size).min(items.len());
    &items[start..end]
}

/// Contiguous run of page numbers centred on `current`, at most `max_visible` long
/// and always inside `1..=total`.
pub fn visible_page_window(current: usize, total: usize, max_visible: usize) -> Vec<usize> {
    if total == 0 || max_visible == 0 {
        return Vec::new();
    }
    let delta = max_visible / 2;
    let start = current.saturating_sub(delta).max(1);
    let end = total.min(start + max_visible - 1);
    let start = (end + 1).saturating_sub(max_visible).max(1);
    (start..=end).collect()
}

/// Everything needed to draw a page selector: the window plus explicit first/last
/// shortcuts when the window does not already reach them.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PageControls {
    pub current: usize,
    pub total: usize,
    pub window: Vec<usize>,
    pub show_first: bool,
    pub leading_ellipsis: bool,
    pub trailing_ellipsis: bool,
    pub show_last: bool,
}

impl PageControls {
    /// `None` when there is a single page or none.
    pub fn build(current: usize, total: usize, max_visible: usize) -> Option<Self> {
        if total <= 1 {
            return None;
        }
        let window = visible_page_window(current, total, max_visible.max(1));
        let first = window.first().copied().unwrap_or(1);
        let last = window.last().copied().unwrap_or(total);
        Some(Self {
            current,
            total,
            show_first: first > 1,
            leading_ellipsis: first > 2,
            trailing_ellipsis: last + 1 < total,
            show_last: last < total,
            window,
        })
    }

    pub fn has_previous(&self) -> bool {
        self.current > 1
    }

    pub fn has_next(&self) -> bool {
        self.current < self.total
    }
}

impl fmt::Display for PageControls {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut parts = Vec::new();
        if self.has_previous() {
            parts.push("«".to_string());
            parts.push("‹".to_string());
        }
        if self.show_first {
            parts.push("1".to_string());
        }
        if self.leading_ellipsis {
            parts.push("…".to_string());
        }
        for page in &self.window {
            if *page == self.current {
                parts.push(format!("[{page}]"));
            } else {
                parts.push(page.to_string());
            }
        }
        if self.trailing_ellipsis {
            parts.push("…".to_string());
        }
        if self.show_last {
            parts.push(self.total.to_string());
        }
        if self.has_next() {
            parts.push("›".to_string());
            parts.push("»".to_string());
        }
        f.write_str(&parts.join(" "))
    }
}

/// One rendered page of a filtered list.
#[derive(Debug, Clone, PartialEq)]
pub struct Page<T> {
    pub items: Vec<T>,
    pub current_page: usize,
    pub total_pages: usize,
    pub total_items: usize,
    pub page_size: usize,
}

impl<T> Page<T> {
    /// Slice `filtered` at `requested_page`, clamped into the valid range.
    pub fn new(filtered: Vec<T>, requested_page: usize, page_size: usize) -> Self {
        let page_size = page_size.max(1);
        let total_items = filtered.len();
        let total_pages = total_pages(total_items, page_size);
        let current_page = requested_page.clamp(1, total_pages.max(1));
        let start = (current_page - 1) * page_size;
        let items = filtered
            .into_iter()
            .skip(start)
            .take(page_size)
            .collect::<Vec<_>>();
        Self {
            items,
            current_page,
            total_pages,
            total_items,
            page_size,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    /// 1-based inclusive range shown on this page, for "showing X-Y of Z".
    pub fn showing(&self) -> Option<(usize, usize)> {
        if self.items.is_empty() {
            return None;
        }
        let start = (self.current_page - 1) * self.page_size + 1;
        Some((start, start + self.items.len() - 1))
    }

    pub fn controls(&self, max_visible: usize) -> Option<PageControls> {
        PageControls::build(self.current_page, self.total_pages, max_visible)
    }
}

// ---------------------------------------------------------------------------
// Favorites
// ---------------------------------------------------------------------------

/// True iff an entry matches both id and type.
pub fn is_favorite(favorites: &[FavoriteEntry], item_id: &str, item_type: ItemType) -> bool {
    favorites
        .iter()
        .any(|f| f.item_id == item_id && f.item_type == item_type)
}

/// Snapshot of one user's favorites as fetched for the current view.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FavoritesIndex {
    entries: Vec<FavoriteEntry>,
}

impl FavoritesIndex {
    pub fn new(entries: Vec<FavoriteEntry>) -> Self {
        Self { entries }
    }

    pub fn contains(&self, item_id: &str, item_type: ItemType) -> bool {
        is_favorite(&self.entries, item_id, item_type)
    }

    pub fn ids_of(&self, item_type: ItemType) -> Vec<&str> {
        self.entries
            .iter()
            .filter(|f| f.item_type == item_type)
            .map(|f| f.item_id.as_str())
            .collect()
    }

    pub fn entries(&self) -> &[FavoriteEntry] {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
