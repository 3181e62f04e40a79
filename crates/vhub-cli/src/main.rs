use std::process::ExitCode;
use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::NaiveDate;
use clap::{Parser, Subcommand};
use serde_json::Value;
use tracing::warn;
use tracing_subscriber::EnvFilter;
use vhub_browse::{foundation_image, opportunity_image, FavoritesIndex, Page};
use vhub_client::{ApiClient, ApiError, ClientConfig, MarketplaceApi};
use vhub_core::{
    Foundation, FoundationFilter, FoundationSort, ItemType, OpaqueRecord, Opportunity,
    OpportunityFilter, OpportunityStatus,
};
use vhub_pages::{
    load_favorites, load_foundation_detail, load_opportunity_detail, EnrichmentReport,
    FavoriteToggle, FoundationsPage, OpportunitiesPage, OpportunitySource, PagesConfig,
};

#[derive(Debug, Parser)]
#[command(name = "vhub")]
#[command(about = "Browse foundations and volunteer opportunities")]
struct Cli {
    /// Backend base URL, e.g. http://localhost:3001/api
    #[arg(long, global = true)]
    api_url: Option<String>,
    #[arg(long, global = true)]
    page_size: Option<usize>,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    Foundations {
        #[arg(long, default_value = "")]
        search: String,
        #[arg(long, default_value = "")]
        location: String,
        #[arg(long, default_value = "name")]
        sort: FoundationSort,
        #[arg(long, default_value_t = 1)]
        page: usize,
    },
    Opportunities {
        #[arg(long, default_value = "")]
        search: String,
        #[arg(long)]
        status: Option<OpportunityStatus>,
        #[arg(long, default_value = "")]
        location: String,
        /// Earliest start date, YYYY-MM-DD
        #[arg(long)]
        from: Option<NaiveDate>,
        /// Latest end date, YYYY-MM-DD
        #[arg(long)]
        to: Option<NaiveDate>,
        #[arg(long)]
        active_only: bool,
        #[arg(long, default_value_t = 1)]
        page: usize,
    },
    Foundation {
        id: String,
    },
    Opportunity {
        id: String,
    },
    Favorites,
    Favorite {
        #[command(subcommand)]
        action: FavoriteAction,
    },
    Login {
        #[arg(long)]
        email: String,
        #[arg(long)]
        password: String,
    },
    Logout,
    Whoami,
    Notifications {
        #[arg(long)]
        unread: bool,
        #[arg(long, value_name = "ID")]
        mark_read: Option<String>,
        #[arg(long)]
        mark_all_read: bool,
    },
    Donations,
    /// Donate to a foundation
    Donate {
        foundation_id: String,
        amount: f64,
    },
    Comment {
        item_type: ItemType,
        id: String,
        text: String,
    },
    /// Rate a foundation or opportunity from 1 to 5
    Rate {
        item_type: ItemType,
        id: String,
        #[arg(value_parser = clap::value_parser!(u8).range(1..=5))]
        rating: u8,
    },
    Participations,
    Apply {
        opportunity_id: String,
        #[arg(long)]
        message: Option<String>,
    },
}

#[derive(Debug, Subcommand)]
enum FavoriteAction {
    Add { item_type: ItemType, id: String },
    Remove { item_type: ItemType, id: String },
}

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")))
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    match run(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            if err
                .downcast_ref::<ApiError>()
                .is_some_and(ApiError::is_unauthorized)
            {
                eprintln!("session expired, please log in");
            } else {
                eprintln!("error: {err:#}");
            }
            ExitCode::FAILURE
        }
    }
}

async fn run(cli: Cli) -> Result<()> {
    let mut client_config = ClientConfig::from_env();
    if let Some(url) = cli.api_url {
        client_config.base_url = url;
    }
    let mut pages = PagesConfig::from_env();
    if let Some(size) = cli.page_size.filter(|s| *s > 0) {
        pages.page_size = size;
    }
    let client = Arc::new(ApiClient::from_config(&client_config).await?);

    match cli.command {
        Commands::Foundations {
            search,
            location,
            sort,
            page,
        } => {
            let view = FoundationsPage::new(client.clone(), pages);
            view.load().await.context("loading foundations")?;
            view.set_filter(FoundationFilter {
                search,
                location,
                sort_by: sort,
            })
            .await;
            view.go_to_page(page).await;

            let favorites = favorites_snapshot(client.as_ref()).await?;
            let page = view.view().await;
            for foundation in &page.items {
                println!("{}", foundation_card(foundation, &favorites));
            }
            println!("{}", page_footer(&page, pages.max_visible_pages));
        }
        Commands::Opportunities {
            search,
            status,
            location,
            from,
            to,
            active_only,
            page,
        } => {
            let source = if active_only {
                OpportunitySource::ActiveOnly
            } else {
                OpportunitySource::All
            };
            let view = OpportunitiesPage::new(client.clone(), pages, source);
            view.load().await.context("loading opportunities")?;
            view.set_filter(OpportunityFilter {
                search,
                status,
                location,
                start_date: from,
                end_date: to,
            })
            .await;
            view.go_to_page(page).await;

            let favorites = favorites_snapshot(client.as_ref()).await?;
            let page = view.view().await;
            for opportunity in &page.items {
                println!("{}", opportunity_card(opportunity, &favorites));
            }
            println!("{}", page_footer(&page, pages.max_visible_pages));
            print_report(&view.report().await);
        }
        Commands::Foundation { id } => {
            let detail = load_foundation_detail(client.as_ref(), &id, &pages).await?;
            let favorites = marker_index(detail.is_favorite, &id, ItemType::Foundation);
            println!("{}", foundation_card(&detail.foundation, &favorites));
            if let Some(description) = &detail.foundation.description {
                println!("    {description}");
            }
            if let Some(website) = &detail.foundation.website {
                println!("    web: {website}");
            }
            println!("\n{} opportunities", detail.opportunities.len());
            for opportunity in &detail.opportunities {
                println!("{}", opportunity_card(opportunity, &FavoritesIndex::default()));
            }
            print_report(&detail.report);
        }
        Commands::Opportunity { id } => {
            let detail = load_opportunity_detail(client.as_ref(), &id, &pages).await?;
            let favorites = marker_index(detail.is_favorite, &id, ItemType::Opportunity);
            println!("{}", opportunity_card(&detail.opportunity, &favorites));
            if let Some(description) = &detail.opportunity.description {
                println!("    {description}");
            }
            println!("\n{} comments", detail.comments.len());
            for comment in &detail.comments {
                println!("  - {}", record_summary(comment));
            }
            print_report(&detail.report);
        }
        Commands::Favorites => {
            let view = load_favorites(client.as_ref(), &pages).await?;
            if view.total() == 0 {
                println!("no favorites yet");
            }
            for foundation in &view.foundations {
                println!("{}", foundation_card(foundation, &view.index));
            }
            for opportunity in &view.opportunities {
                println!("{}", opportunity_card(opportunity, &view.index));
            }
            if view.unavailable > 0 {
                println!("({} favorites are no longer available)", view.unavailable);
            }
            print_report(&view.report);
        }
        Commands::Favorite { action } => {
            let (item_type, id, want) = match action {
                FavoriteAction::Add { item_type, id } => (item_type, id, true),
                FavoriteAction::Remove { item_type, id } => (item_type, id, false),
            };
            let mut toggle = FavoriteToggle::load(client.as_ref(), &id, item_type).await?;
            if toggle.is_favorite() != want {
                toggle.toggle().await?;
            }
            let state = if toggle.is_favorite() { "in" } else { "not in" };
            println!("{item_type} {id} is {state} your favorites");
        }
        Commands::Login { email, password } => {
            let session = client.login(&email, &password).await?;
            println!(
                "logged in as {}",
                session.user.name.as_deref().unwrap_or(&email)
            );
            if let Some(foundation) = &session.foundation {
                println!("managing {}", foundation.legal_name);
            }
        }
        Commands::Logout => {
            client.logout().await?;
            println!("logged out");
        }
        Commands::Whoami => match client.session().current().await {
            Some(session) => {
                let user = &session.user;
                println!(
                    "{} <{}> ({})",
                    user.name.as_deref().unwrap_or("-"),
                    user.email.as_deref().unwrap_or("-"),
                    user.user_type.as_deref().unwrap_or("user")
                );
            }
            None => println!("not logged in"),
        },
        Commands::Notifications {
            unread,
            mark_read,
            mark_all_read,
        } => {
            if let Some(id) = mark_read {
                client.mark_notification_read(&id).await?;
            }
            if mark_all_read {
                client.mark_all_notifications_read().await?;
            }
            let notifications = client.my_notifications(unread).await?;
            if notifications.is_empty() {
                println!("no notifications");
            }
            for notification in &notifications {
                println!("- {}", record_summary(notification));
            }
        }
        Commands::Donations => {
            let donations = client.my_donations().await?;
            if donations.is_empty() {
                println!("no donations");
            }
            for donation in &donations {
                println!("- {}", record_summary(donation));
            }
        }
        Commands::Donate {
            foundation_id,
            amount,
        } => {
            client.create_donation(&foundation_id, amount).await?;
            println!("donated {amount:.2} to foundation {foundation_id}");
        }
        Commands::Comment {
            item_type,
            id,
            text,
        } => {
            client.create_comment(item_type, &id, &text).await?;
            println!("comment posted on {item_type} {id}");
        }
        Commands::Rate {
            item_type,
            id,
            rating,
        } => {
            client.create_rating(item_type, &id, rating).await?;
            println!("rated {item_type} {id} with {rating}/5");
        }
        Commands::Participations => {
            let participations = client.my_participations().await?;
            if participations.is_empty() {
                println!("no participation requests");
            }
            for participation in &participations {
                println!("- {}", record_summary(participation));
            }
        }
        Commands::Apply {
            opportunity_id,
            message,
        } => {
            client
                .apply_to_opportunity(&opportunity_id, message.as_deref())
                .await?;
            println!("application sent for opportunity {opportunity_id}");
        }
    }

    Ok(())
}

/// Favorites of the logged-in user for star markers; empty when logged out.
async fn favorites_snapshot(client: &ApiClient) -> Result<FavoritesIndex> {
    if !client.session().is_logged_in().await {
        return Ok(FavoritesIndex::default());
    }
    match client.favorites().await {
        Ok(entries) => Ok(FavoritesIndex::new(entries)),
        Err(err) if err.is_unauthorized() => Err(err.into()),
        Err(err) => {
            warn!(%err, "favorites unavailable; markers omitted");
            Ok(FavoritesIndex::default())
        }
    }
}

fn marker_index(is_favorite: Option<bool>, id: &str, item_type: ItemType) -> FavoritesIndex {
    match is_favorite {
        Some(true) => FavoritesIndex::new(vec![vhub_core::FavoriteEntry::new(id, item_type)]),
        _ => FavoritesIndex::default(),
    }
}

fn star(favorites: &FavoritesIndex, id: &str, item_type: ItemType) -> &'static str {
    if favorites.contains(id, item_type) {
        "★"
    } else {
        "☆"
    }
}

fn foundation_card(foundation: &Foundation, favorites: &FavoritesIndex) -> String {
    let mut card = format!(
        "{} {} (#{})",
        star(favorites, &foundation.id, ItemType::Foundation),
        foundation.legal_name,
        foundation.id
    );
    if foundation.verified {
        card.push_str("  verified");
    }
    if let Some(address) = &foundation.address {
        card.push_str(&format!("\n    {address}"));
    }
    card.push_str(&format!("\n    image: {}", foundation_image(foundation)));
    card
}

fn opportunity_card(opportunity: &Opportunity, favorites: &FavoritesIndex) -> String {
    let mut card = format!(
        "{} {} (#{})  [{}]",
        star(favorites, &opportunity.id, ItemType::Opportunity),
        opportunity.display_title(),
        opportunity.id,
        opportunity.status()
    );
    if let Some(rating) = opportunity.average_rating {
        card.push_str(&format!("  {rating:.1}/5"));
    }
    card.push_str(&format!("\n    {}", opportunity.foundation_label()));
    if let Some(location) = &opportunity.location {
        card.push_str(&format!("\n    {location}"));
    }
    card.push_str(&format!(
        "\n    {} → {}",
        opportunity.start_date.format("%Y-%m-%d"),
        opportunity.end_date.format("%Y-%m-%d")
    ));
    card.push_str(&format!("\n    image: {}", opportunity_image(opportunity)));
    card
}

fn page_footer<T>(page: &Page<T>, max_visible: usize) -> String {
    let Some((first, last)) = page.showing() else {
        return "no results".to_string();
    };
    let mut footer = format!("showing {first}–{last} of {}", page.total_items);
    if let Some(controls) = page.controls(max_visible) {
        footer.push_str(&format!("\n{controls}"));
    }
    footer
}

fn print_report(report: &EnrichmentReport) {
    if !report.is_clean() {
        eprintln!(
            "{} of {} items shown with partial details",
            report.failures.len(),
            report.attempted
        );
    }
}

/// One-line rendering of an opaque backend record.
fn record_summary(record: &OpaqueRecord) -> String {
    ["message", "content", "text", "title", "comment", "status", "amount"]
        .iter()
        .find_map(|key| match record.get(key) {
            Some(Value::String(text)) => Some(text.clone()),
            Some(Value::Number(n)) => Some(n.to_string()),
            _ => None,
        })
        .unwrap_or_else(|| record.to_string())
}
