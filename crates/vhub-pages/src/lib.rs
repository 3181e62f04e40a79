//! Page controllers: fetch from the backend, enrich, then filter and paginate
//! through `vhub-browse`.

use std::fmt;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use futures::stream::{self, StreamExt};
use tokio::sync::RwLock;
use tracing::{debug, warn};
use vhub_browse::{
    filter_foundations, filter_opportunities, is_favorite, FavoritesIndex, Page,
    DEFAULT_MAX_VISIBLE_PAGES, DEFAULT_PAGE_SIZE,
};
use vhub_client::{ApiError, MarketplaceApi};
use vhub_core::{
    FavoriteEntry, Foundation, FoundationFilter, ItemType, OpaqueRecord, Opportunity,
    OpportunityFilter,
};

pub const CRATE_NAME: &str = "vhub-pages";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PagesConfig {
    pub page_size: usize,
    pub max_visible_pages: usize,
    /// Upper bound on in-flight enrichment requests per batch.
    pub enrich_concurrency: usize,
}

impl Default for PagesConfig {
    fn default() -> Self {
        Self {
            page_size: DEFAULT_PAGE_SIZE,
            max_visible_pages: DEFAULT_MAX_VISIBLE_PAGES,
            enrich_concurrency: 8,
        }
    }
}

impl PagesConfig {
    pub fn from_env() -> Self {
        let defaults = Self::default();
        let read = |key: &str, fallback: usize| {
            std::env::var(key)
                .ok()
                .and_then(|v| v.parse::<usize>().ok())
                .filter(|v| *v > 0)
                .unwrap_or(fallback)
        };
        Self {
            page_size: read("VHUB_PAGE_SIZE", defaults.page_size),
            max_visible_pages: read("VHUB_MAX_VISIBLE_PAGES", defaults.max_visible_pages),
            enrich_concurrency: read("VHUB_ENRICH_CONCURRENCY", defaults.enrich_concurrency),
        }
    }
}

/// Run `tasks` with at most `limit` in flight. Results line up with the input
/// order regardless of completion order.
pub async fn gather<I, F, T>(tasks: I, limit: usize) -> Vec<Result<T, ApiError>>
where
    I: IntoIterator<Item = F>,
    F: Future<Output = Result<T, ApiError>>,
{
    stream::iter(tasks).buffered(limit.max(1)).collect().await
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnrichedField {
    Foundation,
    Rating,
}

impl fmt::Display for EnrichedField {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Foundation => f.write_str("foundation"),
            Self::Rating => f.write_str("rating"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EnrichmentFailure {
    pub item_id: String,
    pub field: EnrichedField,
    pub error: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EnrichmentReport {
    pub attempted: usize,
    pub failures: Vec<EnrichmentFailure>,
}

impl EnrichmentReport {
    pub fn is_clean(&self) -> bool {
        self.failures.is_empty()
    }

    /// Keep going on ordinary failures; a rejected session ends the batch.
    fn absorb(
        &mut self,
        item_id: &str,
        field: EnrichedField,
        err: ApiError,
    ) -> Result<(), ApiError> {
        if err.is_unauthorized() {
            return Err(err);
        }
        warn!(item_id, %field, %err, "enrichment failed; keeping item without it");
        self.failures.push(EnrichmentFailure {
            item_id: item_id.to_string(),
            field,
            error: err.to_string(),
        });
        Ok(())
    }
}

/// Attach foundation and average rating to each opportunity. Items that already
/// carry a foundation skip that lookup. Output order equals input order.
pub async fn enrich_opportunities<A>(
    api: &A,
    items: Vec<Opportunity>,
    limit: usize,
) -> Result<(Vec<Opportunity>, EnrichmentReport), ApiError>
where
    A: MarketplaceApi + ?Sized,
{
    let foundation_tasks = items.iter().map(|o| async move {
        match &o.foundation {
            Some(_) => Ok(None),
            None => api.foundation(&o.foundation_id).await.map(Some),
        }
    });
    let rating_tasks = items.iter().map(|o| api.average_rating(&o.id));

    let (foundations, ratings) = futures::join!(
        gather(foundation_tasks, limit),
        gather(rating_tasks, limit)
    );

    let mut report = EnrichmentReport {
        attempted: items.len(),
        failures: Vec::new(),
    };
    let mut enriched = Vec::with_capacity(items.len());
    for ((mut opportunity, foundation), rating) in items.into_iter().zip(foundations).zip(ratings)
    {
        match foundation {
            Ok(Some(found)) => opportunity.foundation = Some(found),
            Ok(None) => {}
            Err(err) => report.absorb(&opportunity.id, EnrichedField::Foundation, err)?,
        }
        match rating {
            Ok(summary) => opportunity.average_rating = Some(summary.average_rating),
            Err(err) => report.absorb(&opportunity.id, EnrichedField::Rating, err)?,
        }
        enriched.push(opportunity);
    }
    Ok((enriched, report))
}

/// Generation counter that lets a view drop responses which arrive after it was
/// reloaded or left.
#[derive(Debug, Default)]
pub struct LoadGuard {
    generation: AtomicU64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LoadTicket(u64);

impl LoadGuard {
    pub fn begin(&self) -> LoadTicket {
        LoadTicket(self.generation.fetch_add(1, Ordering::SeqCst) + 1)
    }

    pub fn is_current(&self, ticket: LoadTicket) -> bool {
        self.generation.load(Ordering::SeqCst) == ticket.0
    }

    /// Invalidate every outstanding ticket.
    pub fn abandon(&self) {
        self.generation.fetch_add(1, Ordering::SeqCst);
    }

    /// Outcome of a failed load: a stale failure is dropped like a stale
    /// response, but a rejected session always surfaces.
    pub fn settle_failure(
        &self,
        ticket: LoadTicket,
        err: ApiError,
    ) -> Result<LoadOutcome, ApiError> {
        if !err.is_unauthorized() && !self.is_current(ticket) {
            debug!(%err, "discarding failure of a stale load");
            return Ok(LoadOutcome::Discarded);
        }
        Err(err)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoadOutcome {
    Committed { items: usize },
    Discarded,
}

#[derive(Debug, Default)]
struct FoundationsState {
    foundations: Vec<Foundation>,
    filter: FoundationFilter,
    page: usize,
}

/// Foundations list view.
pub struct FoundationsPage<A> {
    api: Arc<A>,
    config: PagesConfig,
    guard: LoadGuard,
    state: RwLock<FoundationsState>,
}

impl<A: MarketplaceApi> FoundationsPage<A> {
    pub fn new(api: Arc<A>, config: PagesConfig) -> Self {
        Self {
            api,
            config,
            guard: LoadGuard::default(),
            state: RwLock::new(FoundationsState {
                page: 1,
                ..Default::default()
            }),
        }
    }

    /// Fetch the full list. Safe to call again as a retry.
    pub async fn load(&self) -> Result<LoadOutcome, ApiError> {
        let ticket = self.guard.begin();
        let foundations = match self.api.foundations().await {
            Ok(foundations) => foundations,
            Err(err) => return self.guard.settle_failure(ticket, err),
        };

        let mut state = self.state.write().await;
        if !self.guard.is_current(ticket) {
            debug!("discarding stale foundations response");
            return Ok(LoadOutcome::Discarded);
        }
        let items = foundations.len();
        state.foundations = foundations;
        state.page = 1;
        Ok(LoadOutcome::Committed { items })
    }

    pub fn leave(&self) {
        self.guard.abandon();
    }

    pub async fn filter(&self) -> FoundationFilter {
        self.state.read().await.filter.clone()
    }

    pub async fn set_filter(&self, filter: FoundationFilter) {
        let mut state = self.state.write().await;
        state.filter = filter;
        state.page = 1;
    }

    pub async fn clear_filters(&self) {
        self.set_filter(FoundationFilter::default()).await;
    }

    pub async fn go_to_page(&self, page: usize) {
        self.state.write().await.page = page.max(1);
    }

    pub async fn view(&self) -> Page<Foundation> {
        let state = self.state.read().await;
        let filtered = filter_foundations(&state.foundations, &state.filter);
        Page::new(filtered, state.page, self.config.page_size)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum OpportunitySource {
    #[default]
    All,
    ActiveOnly,
    /// Opportunities of one foundation, by id.
    Foundation(String),
}

#[derive(Debug, Default)]
struct OpportunitiesState {
    opportunities: Vec<Opportunity>,
    report: EnrichmentReport,
    filter: OpportunityFilter,
    page: usize,
}

/// Opportunities list view with enrichment.
pub struct OpportunitiesPage<A> {
    api: Arc<A>,
    config: PagesConfig,
    source: OpportunitySource,
    guard: LoadGuard,
    state: RwLock<OpportunitiesState>,
}

impl<A: MarketplaceApi> OpportunitiesPage<A> {
    pub fn new(api: Arc<A>, config: PagesConfig, source: OpportunitySource) -> Self {
        Self {
            api,
            config,
            source,
            guard: LoadGuard::default(),
            state: RwLock::new(OpportunitiesState {
                page: 1,
                ..Default::default()
            }),
        }
    }

    pub fn source(&self) -> &OpportunitySource {
        &self.source
    }

    async fn fetch(&self) -> Result<(Vec<Opportunity>, EnrichmentReport), ApiError> {
        let raw = match &self.source {
            OpportunitySource::All => self.api.opportunities().await?,
            OpportunitySource::ActiveOnly => self.api.active_opportunities().await?,
            OpportunitySource::Foundation(id) => self.api.opportunities_by_foundation(id).await?,
        };
        enrich_opportunities(self.api.as_ref(), raw, self.config.enrich_concurrency).await
    }

    /// Fetch and enrich. Safe to call again as a retry.
    pub async fn load(&self) -> Result<LoadOutcome, ApiError> {
        let ticket = self.guard.begin();
        let (opportunities, report) = match self.fetch().await {
            Ok(loaded) => loaded,
            Err(err) => return self.guard.settle_failure(ticket, err),
        };

        let mut state = self.state.write().await;
        if !self.guard.is_current(ticket) {
            debug!("discarding stale opportunities response");
            return Ok(LoadOutcome::Discarded);
        }
        let items = opportunities.len();
        state.opportunities = opportunities;
        state.report = report;
        state.page = 1;
        Ok(LoadOutcome::Committed { items })
    }

    pub fn leave(&self) {
        self.guard.abandon();
    }

    pub async fn report(&self) -> EnrichmentReport {
        self.state.read().await.report.clone()
    }

    pub async fn filter(&self) -> OpportunityFilter {
        self.state.read().await.filter.clone()
    }

    pub async fn set_filter(&self, filter: OpportunityFilter) {
        let mut state = self.state.write().await;
        state.filter = filter;
        state.page = 1;
    }

    pub async fn clear_filters(&self) {
        self.set_filter(OpportunityFilter::default()).await;
    }

    pub async fn go_to_page(&self, page: usize) {
        self.state.write().await.page = page.max(1);
    }

    /// Status filtering uses the clock at the time of this call.
    pub async fn view(&self) -> Page<Opportunity> {
        let state = self.state.read().await;
        let filtered = filter_opportunities(&state.opportunities, &state.filter);
        Page::new(filtered, state.page, self.config.page_size)
    }
}

/// Favorite status for a detail view: `None` when nobody is logged in or the
/// snapshot could not be fetched.
async fn favorite_status<A>(
    api: &A,
    item_id: &str,
    item_type: ItemType,
) -> Result<Option<bool>, ApiError>
where
    A: MarketplaceApi + ?Sized,
{
    match api.favorites().await {
        Ok(entries) => Ok(Some(is_favorite(&entries, item_id, item_type))),
        Err(ApiError::NotLoggedIn) => Ok(None),
        Err(err) if err.is_unauthorized() => Err(err),
        Err(err) => {
            warn!(%err, "could not fetch favorites snapshot");
            Ok(None)
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct FoundationDetail {
    pub foundation: Foundation,
    pub opportunities: Vec<Opportunity>,
    pub report: EnrichmentReport,
    pub is_favorite: Option<bool>,
}

pub async fn load_foundation_detail<A>(
    api: &A,
    foundation_id: &str,
    config: &PagesConfig,
) -> Result<FoundationDetail, ApiError>
where
    A: MarketplaceApi + ?Sized,
{
    let (foundation, opportunities) = futures::try_join!(
        api.foundation(foundation_id),
        api.opportunities_by_foundation(foundation_id)
    )?;
    let opportunities = opportunities
        .into_iter()
        .map(|mut o| {
            o.foundation = Some(foundation.clone());
            o
        })
        .collect();
    let (opportunities, report) =
        enrich_opportunities(api, opportunities, config.enrich_concurrency).await?;
    let is_favorite = favorite_status(api, &foundation.id, ItemType::Foundation).await?;

    Ok(FoundationDetail {
        foundation,
        opportunities,
        report,
        is_favorite,
    })
}

#[derive(Debug, Clone, PartialEq)]
pub struct OpportunityDetail {
    pub opportunity: Opportunity,
    pub comments: Vec<OpaqueRecord>,
    pub report: EnrichmentReport,
    pub is_favorite: Option<bool>,
}

pub async fn load_opportunity_detail<A>(
    api: &A,
    opportunity_id: &str,
    config: &PagesConfig,
) -> Result<OpportunityDetail, ApiError>
where
    A: MarketplaceApi + ?Sized,
{
    let opportunity = api.opportunity(opportunity_id).await?;
    let (enriched, comments) = futures::join!(
        enrich_opportunities(api, vec![opportunity], config.enrich_concurrency),
        api.opportunity_comments(opportunity_id)
    );
    let (mut enriched, report) = enriched?;
    let comments = match comments {
        Ok(comments) => comments,
        Err(err) if err.is_unauthorized() => return Err(err),
        Err(err) => {
            warn!(%err, opportunity_id, "comments unavailable");
            Vec::new()
        }
    };
    let opportunity = enriched
        .pop()
        .ok_or_else(|| ApiError::HttpStatus {
            status: 404,
            url: format!("/opportunities/{opportunity_id}"),
            message: "opportunity not found".to_string(),
        })?;
    let is_favorite = favorite_status(api, &opportunity.id, ItemType::Opportunity).await?;

    Ok(OpportunityDetail {
        opportunity,
        comments,
        report,
        is_favorite,
    })
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct FavoritesView {
    pub index: FavoritesIndex,
    pub foundations: Vec<Foundation>,
    pub opportunities: Vec<Opportunity>,
    /// Favorites whose record could not be fetched; they are left out of the lists.
    pub unavailable: usize,
    pub report: EnrichmentReport,
}

impl FavoritesView {
    pub fn total(&self) -> usize {
        self.foundations.len() + self.opportunities.len()
    }
}

fn keep_available<T>(
    results: Vec<Result<T, ApiError>>,
    unavailable: &mut usize,
) -> Result<Vec<T>, ApiError> {
    let mut out = Vec::with_capacity(results.len());
    for result in results {
        match result {
            Ok(item) => out.push(item),
            Err(err) if err.is_unauthorized() => return Err(err),
            Err(err) => {
                warn!(%err, "favorite item unavailable");
                *unavailable += 1;
            }
        }
    }
    Ok(out)
}

/// Favorites of the logged-in user resolved to full records.
pub async fn load_favorites<A>(api: &A, config: &PagesConfig) -> Result<FavoritesView, ApiError>
where
    A: MarketplaceApi + ?Sized,
{
    let index = FavoritesIndex::new(api.favorites().await?);
    let foundation_ids = index.ids_of(ItemType::Foundation);
    let opportunity_ids = index.ids_of(ItemType::Opportunity);
    let limit = config.enrich_concurrency;

    let (foundations, opportunities) = futures::join!(
        gather(foundation_ids.iter().map(|id| api.foundation(id)), limit),
        gather(opportunity_ids.iter().map(|id| api.opportunity(id)), limit)
    );

    let mut unavailable = 0;
    let foundations = keep_available(foundations, &mut unavailable)?;
    let opportunities = keep_available(opportunities, &mut unavailable)?;
    let (opportunities, report) = enrich_opportunities(api, opportunities, limit).await?;

    Ok(FavoritesView {
        index,
        foundations,
        opportunities,
        unavailable,
        report,
    })
}

/// Favorite button state for one item. The local flag only flips once the
/// backend accepted the change.
pub struct FavoriteToggle<'a, A: ?Sized> {
    api: &'a A,
    item_id: String,
    item_type: ItemType,
    is_favorite: bool,
}

impl<'a, A> FavoriteToggle<'a, A>
where
    A: MarketplaceApi + ?Sized,
{
    pub fn from_index(
        api: &'a A,
        item_id: &str,
        item_type: ItemType,
        index: &FavoritesIndex,
    ) -> Self {
        Self {
            api,
            item_id: item_id.to_string(),
            item_type,
            is_favorite: index.contains(item_id, item_type),
        }
    }

    /// Fetch a fresh favorites snapshot for this item.
    pub async fn load(api: &'a A, item_id: &str, item_type: ItemType) -> Result<Self, ApiError> {
        let entries: Vec<FavoriteEntry> = api.favorites().await?;
        Ok(Self::from_index(
            api,
            item_id,
            item_type,
            &FavoritesIndex::new(entries),
        ))
    }

    pub fn is_favorite(&self) -> bool {
        self.is_favorite
    }

    /// Add or remove, returning the new state.
    pub async fn toggle(&mut self) -> Result<bool, ApiError> {
        if self.is_favorite {
            self.api.remove_favorite(&self.item_id).await?;
        } else {
            self.api.add_favorite(&self.item_id, self.item_type).await?;
        }
        self.is_favorite = !self.is_favorite;
        Ok(self.is_favorite)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::{HashMap, HashSet};
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;

    use async_trait::async_trait;
    use chrono::{TimeZone, Utc};
    use tokio::sync::{Mutex, Notify};
    use vhub_core::{OpportunityStatus, RatingSummary, FOUNDATION_NOT_SPECIFIED};

    #[derive(Default)]
    struct FakeApi {
        foundations: Vec<Foundation>,
        opportunities: Vec<Opportunity>,
        ratings: HashMap<String, f64>,
        rating_delay_ms: HashMap<String, u64>,
        favorites: Mutex<Vec<FavoriteEntry>>,
        failing_foundations: HashSet<String>,
        failing_opportunities: HashSet<String>,
        reject_ratings: bool,
        fail_writes: bool,
        logged_out: bool,
        /// Holds back the first foundations list call until notified.
        gate: Option<Arc<Notify>>,
        list_calls: AtomicUsize,
        /// Status the foundations list fails with, 401 meaning a rejected session.
        list_failure: Option<u16>,
    }

    fn server_error(path: String) -> ApiError {
        ApiError::HttpStatus {
            status: 500,
            url: path,
            message: "boom".into(),
        }
    }

    #[async_trait]
    impl MarketplaceApi for FakeApi {
        async fn foundations(&self) -> Result<Vec<Foundation>, ApiError> {
            let call = self.list_calls.fetch_add(1, Ordering::SeqCst);
            if let (0, Some(gate)) = (call, &self.gate) {
                gate.notified().await;
            }
            match self.list_failure {
                Some(401) => Err(ApiError::Unauthorized {
                    url: "/foundations".into(),
                }),
                Some(status) => Err(ApiError::HttpStatus {
                    status,
                    url: "/foundations".into(),
                    message: "unavailable".into(),
                }),
                None => Ok(self.foundations.clone()),
            }
        }

        async fn foundation(&self, id: &str) -> Result<Foundation, ApiError> {
            if self.failing_foundations.contains(id) {
                return Err(server_error(format!("/foundations/{id}")));
            }
            self.foundations
                .iter()
                .find(|f| f.id == id)
                .cloned()
                .ok_or_else(|| ApiError::HttpStatus {
                    status: 404,
                    url: format!("/foundations/{id}"),
                    message: "not found".into(),
                })
        }

        async fn opportunities(&self) -> Result<Vec<Opportunity>, ApiError> {
            Ok(self.opportunities.clone())
        }

        async fn active_opportunities(&self) -> Result<Vec<Opportunity>, ApiError> {
            let now = Utc::now();
            Ok(self
                .opportunities
                .iter()
                .filter(|o| o.status_at(now) == OpportunityStatus::Active)
                .cloned()
                .collect())
        }

        async fn opportunities_by_foundation(
            &self,
            foundation_id: &str,
        ) -> Result<Vec<Opportunity>, ApiError> {
            Ok(self
                .opportunities
                .iter()
                .filter(|o| o.foundation_id == foundation_id)
                .cloned()
                .collect())
        }

        async fn opportunity(&self, id: &str) -> Result<Opportunity, ApiError> {
            if self.failing_opportunities.contains(id) {
                return Err(server_error(format!("/opportunities/{id}")));
            }
            self.opportunities
                .iter()
                .find(|o| o.id == id)
                .cloned()
                .ok_or_else(|| server_error(format!("/opportunities/{id}")))
        }

        async fn average_rating(&self, opportunity_id: &str) -> Result<RatingSummary, ApiError> {
            if self.reject_ratings {
                return Err(ApiError::Unauthorized {
                    url: "/ratings".into(),
                });
            }
            if let Some(ms) = self.rating_delay_ms.get(opportunity_id) {
                tokio::time::sleep(Duration::from_millis(*ms)).await;
            }
            Ok(RatingSummary {
                average_rating: self.ratings.get(opportunity_id).copied().unwrap_or(0.0),
                count: 1,
            })
        }

        async fn opportunity_comments(
            &self,
            _opportunity_id: &str,
        ) -> Result<Vec<OpaqueRecord>, ApiError> {
            Ok(vec![sample_comment()])
        }

        async fn favorites(&self) -> Result<Vec<FavoriteEntry>, ApiError> {
            if self.logged_out {
                return Err(ApiError::NotLoggedIn);
            }
            Ok(self.favorites.lock().await.clone())
        }

        async fn add_favorite(&self, item_id: &str, item_type: ItemType) -> Result<(), ApiError> {
            if self.fail_writes {
                return Err(server_error("/favorites".into()));
            }
            self.favorites
                .lock()
                .await
                .push(FavoriteEntry::new(item_id, item_type));
            Ok(())
        }

        async fn remove_favorite(&self, item_id: &str) -> Result<(), ApiError> {
            if self.fail_writes {
                return Err(server_error("/favorites".into()));
            }
            self.favorites.lock().await.retain(|f| f.item_id != item_id);
            Ok(())
        }
    }

    fn sample_comment() -> OpaqueRecord {
        OpaqueRecord::String("great experience".into())
    }

    fn foundation(id: &str, name: &str) -> Foundation {
        Foundation {
            id: id.into(),
            legal_name: name.into(),
            address: Some("Santa Cruz".into()),
            description: None,
            website: None,
            phone: None,
            verified: true,
            image_url: None,
            created_at: None,
        }
    }

    fn opportunity(id: &str, foundation_id: &str, active: bool) -> Opportunity {
        let (start, end) = if active {
            (
                Utc.with_ymd_and_hms(2020, 1, 1, 0, 0, 0).unwrap(),
                Utc.with_ymd_and_hms(2099, 1, 1, 0, 0, 0).unwrap(),
            )
        } else {
            (
                Utc.with_ymd_and_hms(2099, 1, 1, 0, 0, 0).unwrap(),
                Utc.with_ymd_and_hms(2099, 2, 1, 0, 0, 0).unwrap(),
            )
        };
        Opportunity {
            id: id.into(),
            title: Some(format!("Opportunity {id}")),
            description: Some("Help out".into()),
            start_date: start,
            end_date: end,
            location: None,
            foundation_id: foundation_id.into(),
            image_url: None,
            foundation: None,
            average_rating: None,
        }
    }

    #[tokio::test]
    async fn gather_keeps_input_order() {
        let delays = [30u64, 0, 15, 5];
        let results = gather(
            delays.iter().enumerate().map(|(i, ms)| async move {
                tokio::time::sleep(Duration::from_millis(*ms)).await;
                Ok::<_, ApiError>(i)
            }),
            4,
        )
        .await;
        let order = results.into_iter().map(|r| r.unwrap()).collect::<Vec<_>>();
        assert_eq!(order, vec![0, 1, 2, 3]);
    }

    #[tokio::test]
    async fn enrichment_failure_keeps_the_item() {
        let api = FakeApi {
            foundations: vec![foundation("1", "Techo")],
            failing_foundations: HashSet::from(["2".to_string()]),
            ratings: HashMap::from([("a".to_string(), 4.5)]),
            rating_delay_ms: HashMap::from([("a".to_string(), 20)]),
            ..Default::default()
        };
        let items = vec![opportunity("a", "1", true), opportunity("b", "2", true)];

        let (enriched, report) = enrich_opportunities(&api, items, 4).await.expect("enrich");

        assert_eq!(enriched.iter().map(|o| o.id.as_str()).collect::<Vec<_>>(), vec!["a", "b"]);
        assert_eq!(enriched[0].foundation_label(), "Techo");
        assert_eq!(enriched[0].average_rating, Some(4.5));
        assert!(enriched[1].foundation.is_none());
        assert_eq!(enriched[1].foundation_label(), FOUNDATION_NOT_SPECIFIED);
        assert_eq!(report.attempted, 2);
        assert_eq!(report.failures.len(), 1);
        assert_eq!(report.failures[0].item_id, "b");
        assert_eq!(report.failures[0].field, EnrichedField::Foundation);
    }

    #[tokio::test]
    async fn rejected_session_during_enrichment_is_not_swallowed() {
        let api = FakeApi {
            foundations: vec![foundation("1", "Techo")],
            reject_ratings: true,
            ..Default::default()
        };
        let err = enrich_opportunities(&api, vec![opportunity("a", "1", true)], 2)
            .await
            .unwrap_err();
        assert!(err.is_unauthorized());
    }

    #[tokio::test]
    async fn foundations_page_filters_paginates_and_resets_page() {
        let foundations = (1..=20)
            .map(|i| foundation(&i.to_string(), &format!("Fundación {i:02}")))
            .collect::<Vec<_>>();
        let api = Arc::new(FakeApi {
            foundations,
            ..Default::default()
        });
        let page = FoundationsPage::new(api, PagesConfig::default());

        assert_eq!(page.load().await.unwrap(), LoadOutcome::Committed { items: 20 });
        page.go_to_page(3).await;
        let third = page.view().await;
        assert_eq!(third.current_page, 3);
        assert_eq!(third.items.len(), 2);
        assert_eq!(third.total_pages, 3);

        page.set_filter(FoundationFilter {
            search: "fundacion 1".into(),
            ..Default::default()
        })
        .await;
        let filtered = page.view().await;
        assert_eq!(filtered.current_page, 1);
        assert_eq!(filtered.total_items, 0);

        page.set_filter(FoundationFilter {
            search: "Fundación 1".into(),
            ..Default::default()
        })
        .await;
        let filtered = page.view().await;
        assert_eq!(filtered.total_items, 10);
        assert_eq!(filtered.items[0].legal_name, "Fundación 10");

        page.clear_filters().await;
        assert_eq!(page.view().await.total_items, 20);
    }

    #[tokio::test]
    async fn late_response_after_leaving_is_discarded() {
        let gate = Arc::new(Notify::new());
        let api = Arc::new(FakeApi {
            foundations: vec![foundation("1", "Techo")],
            gate: Some(gate.clone()),
            ..Default::default()
        });
        let page = Arc::new(FoundationsPage::new(api, PagesConfig::default()));

        let loading = tokio::spawn({
            let page = page.clone();
            async move { page.load().await }
        });
        tokio::time::sleep(Duration::from_millis(20)).await;
        page.leave();
        gate.notify_one();

        let outcome = loading.await.expect("join").expect("load");
        assert_eq!(outcome, LoadOutcome::Discarded);
        assert_eq!(page.view().await.total_items, 0);
    }

    #[tokio::test]
    async fn newer_load_supersedes_one_in_flight() {
        let gate = Arc::new(Notify::new());
        let api = Arc::new(FakeApi {
            foundations: vec![foundation("1", "Techo"), foundation("2", "Cruz Roja")],
            gate: Some(gate.clone()),
            ..Default::default()
        });
        let page = Arc::new(FoundationsPage::new(api, PagesConfig::default()));

        let first = tokio::spawn({
            let page = page.clone();
            async move { page.load().await }
        });
        tokio::time::sleep(Duration::from_millis(20)).await;

        assert_eq!(page.load().await.unwrap(), LoadOutcome::Committed { items: 2 });
        gate.notify_one();
        assert_eq!(first.await.expect("join").unwrap(), LoadOutcome::Discarded);
        assert_eq!(page.view().await.total_items, 2);
    }

    async fn load_then_leave(list_failure: u16) -> Result<LoadOutcome, ApiError> {
        let gate = Arc::new(Notify::new());
        let api = Arc::new(FakeApi {
            gate: Some(gate.clone()),
            list_failure: Some(list_failure),
            ..Default::default()
        });
        let page = Arc::new(FoundationsPage::new(api, PagesConfig::default()));
        let loading = tokio::spawn({
            let page = page.clone();
            async move { page.load().await }
        });
        tokio::time::sleep(Duration::from_millis(20)).await;
        page.leave();
        gate.notify_one();
        loading.await.expect("join")
    }

    #[tokio::test]
    async fn stale_failure_is_discarded_but_rejected_session_is_not() {
        assert_eq!(load_then_leave(503).await.unwrap(), LoadOutcome::Discarded);
        assert!(load_then_leave(401).await.unwrap_err().is_unauthorized());

        let api = Arc::new(FakeApi {
            list_failure: Some(503),
            ..Default::default()
        });
        let page = FoundationsPage::new(api, PagesConfig::default());
        assert_eq!(page.load().await.unwrap_err().status(), Some(503));
    }

    #[tokio::test]
    async fn opportunities_page_enriches_and_filters_by_status() {
        let api = Arc::new(FakeApi {
            foundations: vec![foundation("1", "Techo")],
            opportunities: vec![
                opportunity("a", "1", true),
                opportunity("b", "1", false),
                opportunity("c", "9", true),
            ],
            ..Default::default()
        });
        let page = OpportunitiesPage::new(api.clone(), PagesConfig::default(), OpportunitySource::All);
        assert_eq!(page.load().await.unwrap(), LoadOutcome::Committed { items: 3 });
        assert_eq!(page.report().await.failures.len(), 1);

        page.set_filter(OpportunityFilter {
            status: Some(OpportunityStatus::Active),
            ..Default::default()
        })
        .await;
        let view = page.view().await;
        assert_eq!(view.items.iter().map(|o| o.id.as_str()).collect::<Vec<_>>(), vec!["a", "c"]);

        page.set_filter(OpportunityFilter {
            search: "techo".into(),
            ..Default::default()
        })
        .await;
        assert_eq!(page.view().await.total_items, 2);

        let active = OpportunitiesPage::new(api.clone(), PagesConfig::default(), OpportunitySource::ActiveOnly);
        assert_eq!(active.load().await.unwrap(), LoadOutcome::Committed { items: 2 });

        let scoped = OpportunitiesPage::new(
            api.clone(),
            PagesConfig::default(),
            OpportunitySource::Foundation("1".into()),
        );
        assert_eq!(scoped.load().await.unwrap(), LoadOutcome::Committed { items: 2 });
        let ids = scoped.view().await.items.iter().map(|o| o.id.clone()).collect::<Vec<_>>();
        assert_eq!(ids, vec!["a", "b"]);

        let unknown = OpportunitiesPage::new(
            api,
            PagesConfig::default(),
            OpportunitySource::Foundation("404".into()),
        );
        assert_eq!(unknown.load().await.unwrap(), LoadOutcome::Committed { items: 0 });
    }

    #[tokio::test]
    async fn favorites_resolve_and_drop_unavailable_items() {
        let api = FakeApi {
            foundations: vec![foundation("1", "Techo")],
            opportunities: vec![opportunity("a", "1", true), opportunity("b", "1", true)],
            failing_opportunities: HashSet::from(["b".to_string()]),
            favorites: Mutex::new(vec![
                FavoriteEntry::new("1", ItemType::Foundation),
                FavoriteEntry::new("a", ItemType::Opportunity),
                FavoriteEntry::new("b", ItemType::Opportunity),
            ]),
            ..Default::default()
        };

        let view = load_favorites(&api, &PagesConfig::default()).await.expect("favorites");
        assert_eq!(view.foundations.len(), 1);
        assert_eq!(view.opportunities.len(), 1);
        assert_eq!(view.opportunities[0].foundation_label(), "Techo");
        assert_eq!(view.unavailable, 1);
        assert_eq!(view.total(), 2);
        assert!(view.index.contains("b", ItemType::Opportunity));
    }

    #[tokio::test]
    async fn toggle_flips_only_after_success() {
        let api = FakeApi::default();
        let mut toggle = FavoriteToggle::load(&api, "5", ItemType::Opportunity)
            .await
            .expect("load");
        assert!(!toggle.is_favorite());
        assert!(toggle.toggle().await.expect("add"));
        assert!(is_favorite(&api.favorites.lock().await, "5", ItemType::Opportunity));
        assert!(!toggle.toggle().await.expect("remove"));

        let failing = FakeApi {
            fail_writes: true,
            ..Default::default()
        };
        let mut toggle = FavoriteToggle::from_index(
            &failing,
            "5",
            ItemType::Opportunity,
            &FavoritesIndex::default(),
        );
        assert!(toggle.toggle().await.is_err());
        assert!(!toggle.is_favorite());
    }

    #[tokio::test]
    async fn detail_views_attach_foundation_comments_and_favorite_state() {
        let api = FakeApi {
            foundations: vec![foundation("1", "Techo")],
            opportunities: vec![opportunity("a", "1", true), opportunity("b", "2", true)],
            favorites: Mutex::new(vec![FavoriteEntry::new("1", ItemType::Foundation)]),
            ..Default::default()
        };
        let config = PagesConfig::default();

        let detail = load_foundation_detail(&api, "1", &config).await.expect("detail");
        assert_eq!(detail.opportunities.len(), 1);
        assert_eq!(detail.opportunities[0].foundation_label(), "Techo");
        assert!(detail.report.is_clean());
        assert_eq!(detail.is_favorite, Some(true));

        let opp = load_opportunity_detail(&api, "a", &config).await.expect("opportunity");
        assert_eq!(opp.comments.len(), 1);
        assert_eq!(opp.is_favorite, Some(false));

        let anonymous = FakeApi {
            logged_out: true,
            ..api
        };
        let opp = load_opportunity_detail(&anonymous, "a", &config).await.expect("anonymous");
        assert_eq!(opp.is_favorite, None);
    }
}
