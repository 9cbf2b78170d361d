//! Raw and view paths must produce identical densified series for every
//! scope, in every configured zone.

use chrono::{DateTime, Duration, NaiveDate, TimeZone, Utc};
use chrono_tz::Tz;
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::{Rng, SeedableRng};
use storepulse_series::*;

const HEADERS: &[&str] = &[
    "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 Chrome/124.0",
    "Mozilla/5.0 (Macintosh; Intel Mac OS X 14_4) Safari/605.1.15",
    "Mozilla/5.0 (compatible; Googlebot/2.1; +http://www.google.com/bot.html)",
    "Mozilla/5.0 (compatible; bingbot/2.0)",
];
const PRODUCTS: &[&str] = &["MUG", "PLATE", "BOWL"];
const TAGS: &[&str] = &["", "email", "ads"];
const GOOGLEBOT: &str = "Mozilla/5.0 (compatible; Googlebot/2.1)";
const HUMAN: &str = "Mozilla/5.0 (X11; Linux x86_64; rv:125.0) Gecko/20100101 Firefox/125.0";

fn date(m: u32, d: u32) -> NaiveDate {
    NaiveDate::from_ymd_opt(2024, m, d).unwrap()
}

fn fixture_start() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 2, 20, 0, 0, 0).unwrap()
}

async fn engine_in(timezone: Tz) -> SeriesEngine {
    let config = EngineConfig {
        timezone,
        ..EngineConfig::default()
    };
    SeriesEngine::connect(config).await.unwrap()
}

/// Seeded events for three tenants spread over late February to mid April
async fn seed_fixture(engine: &SeriesEngine, rng: &mut StdRng) -> Vec<TenantId> {
    let tenants: Vec<TenantId> = (0..3).map(|_| TenantId::generate()).collect();
    let span_secs = 55 * 24 * 3600;

    for tenant in &tenants {
        for _ in 0..120 {
            let at = fixture_start() + Duration::seconds(rng.gen_range(0..span_secs));
            let mut visit = NewVisit::new(*tenant, "/", *HEADERS.choose(rng).unwrap())
                .tag(*TAGS.choose(rng).unwrap())
                .at(at);
            if rng.gen_bool(0.5) {
                visit = visit.product(*PRODUCTS.choose(rng).unwrap());
            }
            engine.store().record_visit(visit).await.unwrap();
        }

        for n in 0..60 {
            let at = fixture_start() + Duration::seconds(rng.gen_range(0..span_secs));
            let mut order = NewOrder::new(*tenant, 0, "EUR", format!("ext-{}", n))
                .tag(*TAGS.choose(rng).unwrap())
                .at(at);
            let mut amount = 0;
            for _ in 0..rng.gen_range(0..4) {
                let price = rng.gen_range(100..5000);
                let quantity = rng.gen_range(1..5);
                amount += price * quantity;
                order = order.line(NewOrderLine::new(*PRODUCTS.choose(rng).unwrap(), "Item", price, quantity));
            }
            order.amount_minor = amount + rng.gen_range(0..500);
            engine.store().record_order(order).await.unwrap();
        }
    }

    tenants
}

fn random_scope(rng: &mut StdRng, tenants: &[TenantId]) -> ScopeFilter {
    let from = date(2, 15) + Duration::days(rng.gen_range(0..60));
    let to = from + Duration::days(rng.gen_range(0..30));
    let mut scope = ScopeFilter::new(*tenants.choose(rng).unwrap(), from, to).unwrap();

    scope = match rng.gen_range(0..4) {
        0 => scope.with_product(ProductFilter::Any),
        1 => scope.with_product(ProductFilter::SiteWide),
        2 => scope.with_product(ProductFilter::Product(PRODUCTS.choose(rng).unwrap().to_string())),
        _ => scope.with_product(ProductFilter::Product("UNSOLD".to_string())),
    };
    if rng.gen_bool(0.3) {
        scope = scope.with_tag(*TAGS.choose(rng).unwrap());
    }
    scope.with_bot_exclusion(rng.gen_bool(0.7))
}

async fn assert_paths_agree(timezone: Tz, seed: u64) {
    let engine = engine_in(timezone).await;
    let mut rng = StdRng::seed_from_u64(seed);
    let tenants = seed_fixture(&engine, &mut rng).await;

    for _ in 0..50 {
        let scope = random_scope(&mut rng, &tenants);
        for kind in MetricKind::ALL {
            let raw = engine.daily_series(&scope, kind, SeriesPath::Raw).await.unwrap();
            let view = engine.daily_series(&scope, kind, SeriesPath::View).await.unwrap();
            assert_eq!(raw, view, "{} diverges in {} for {:?}", kind, timezone, scope);
            assert!(engine.cross_check(&scope, kind).await.is_ok());
        }
    }
}

#[tokio::test]
async fn test_paths_agree_in_utc() {
    assert_paths_agree(Tz::UTC, 7).await;
}

#[tokio::test]
async fn test_paths_agree_across_dst_change() {
    assert_paths_agree(chrono_tz::Europe::Prague, 11).await;
}

#[tokio::test]
async fn test_paths_agree_west_of_utc() {
    assert_paths_agree(chrono_tz::America::New_York, 23).await;
}

#[tokio::test]
async fn test_densified_series_is_complete() {
    let engine = engine_in(chrono_tz::Europe::Prague).await;
    let mut rng = StdRng::seed_from_u64(3);
    let tenants = seed_fixture(&engine, &mut rng).await;

    for _ in 0..20 {
        let scope = random_scope(&mut rng, &tenants);
        let series = engine
            .daily_series(&scope, MetricKind::OrderAmount, SeriesPath::View)
            .await
            .unwrap();

        assert_eq!(series.len() as i64, (scope.to() - scope.from()).num_days() + 1);
        assert_eq!(series.first().map(|m| m.day), Some(scope.from()));
        assert!(series.windows(2).all(|w| w[1].day == w[0].day + Duration::days(1)));
    }
}

#[tokio::test]
async fn test_zero_fill_without_events() {
    let engine = engine_in(Tz::UTC).await;
    let scope = ScopeFilter::new(TenantId::generate(), date(3, 1), date(3, 10)).unwrap();

    for kind in MetricKind::ALL {
        for path in [SeriesPath::Raw, SeriesPath::View] {
            let series = engine.daily_series(&scope, kind, path).await.unwrap();
            assert_eq!(series.len(), 10);
            assert!(series.iter().all(|m| m.value == 0));
            assert!(series.iter().all(|m| m.average.unwrap_or(0.0) == 0.0));
        }
    }
}

#[tokio::test]
async fn test_googlebot_exclusion_toggle() {
    let engine = engine_in(Tz::UTC).await;
    let tenant = TenantId::generate();
    engine
        .store()
        .record_visit(NewVisit::new(tenant, "/", GOOGLEBOT).at(Utc.with_ymd_and_hms(2024, 3, 5, 10, 0, 0).unwrap()))
        .await
        .unwrap();

    let scope = ScopeFilter::new(tenant, date(3, 5), date(3, 5)).unwrap();
    for path in [SeriesPath::Raw, SeriesPath::View] {
        let excluded = engine.daily_series(&scope, MetricKind::VisitCount, path).await.unwrap();
        assert_eq!(excluded[0].value, 0);

        let included = engine
            .daily_series(&scope.clone().with_bot_exclusion(false), MetricKind::VisitCount, path)
            .await
            .unwrap();
        assert_eq!(included[0].value, 1);
    }
}

#[tokio::test]
async fn test_product_scope_separates_site_wide_visits() {
    let engine = engine_in(Tz::UTC).await;
    let tenant = TenantId::generate();
    let (d1, d2) = (date(3, 2), date(3, 4));

    engine
        .store()
        .record_visit(NewVisit::new(tenant, "/", HUMAN).at(Utc.with_ymd_and_hms(2024, 3, 2, 9, 0, 0).unwrap()))
        .await
        .unwrap();
    engine
        .store()
        .record_visit(
            NewVisit::new(tenant, "/p/mug", HUMAN)
                .product("MUG")
                .at(Utc.with_ymd_and_hms(2024, 3, 4, 9, 0, 0).unwrap()),
        )
        .await
        .unwrap();

    let range = ScopeFilter::new(tenant, date(3, 1), date(3, 5)).unwrap();
    for path in [SeriesPath::Raw, SeriesPath::View] {
        let product = engine
            .daily_series(
                &range.clone().with_product(ProductFilter::Product("MUG".into())),
                MetricKind::VisitCount,
                path,
            )
            .await
            .unwrap();
        for metric in &product {
            assert_eq!(metric.value, i64::from(metric.day == d2), "{} on {}", path, metric.day);
        }

        let site_wide = engine
            .daily_series(&range.clone().with_product(ProductFilter::SiteWide), MetricKind::VisitCount, path)
            .await
            .unwrap();
        for metric in &site_wide {
            assert_eq!(metric.value, i64::from(metric.day == d1), "{} on {}", path, metric.day);
        }
    }
}

#[tokio::test]
async fn test_single_day_range() {
    let engine = engine_in(Tz::UTC).await;
    let scope = ScopeFilter::new(TenantId::generate(), date(3, 1), date(3, 1)).unwrap();

    let series = engine
        .daily_series(&scope, MetricKind::OrderCount, SeriesPath::Raw)
        .await
        .unwrap();
    assert_eq!(series.len(), 1);
    assert_eq!(series[0].day, date(3, 1));
}

#[tokio::test]
async fn test_average_over_no_orders_is_zero() {
    let engine = engine_in(Tz::UTC).await;
    let scope = ScopeFilter::new(TenantId::generate(), date(3, 1), date(3, 31)).unwrap();

    assert_eq!(engine.scalars().average_amount(&scope).await.unwrap(), 0.0);
    assert_eq!(engine.scalars().sum_amount(&scope).await.unwrap(), 0);
}

#[tokio::test]
async fn test_out_of_range_product_day_fails_on_both_paths() {
    let engine = engine_in(Tz::UTC).await;
    let tenant = TenantId::generate();

    let rejected = engine
        .store()
        .record_order(NewOrder::new(tenant, 0, "EUR", "huge").line(NewOrderLine::new("P", "P", i64::MAX / 2, 3)))
        .await;
    assert!(matches!(rejected, Err(SeriesError::Validation(_))));

    // Each line sits at the ceiling; ten of them on one day leave the i64 range.
    for n in 0..10 {
        engine
            .store()
            .record_order(
                NewOrder::new(tenant, 0, "EUR", format!("max-{}", n))
                    .line(NewOrderLine::new("P", "P", 1_000_000_000_000, 1_000_000))
                    .at(Utc.with_ymd_and_hms(2024, 3, 2, 9, n, 0).unwrap()),
            )
            .await
            .unwrap();
    }

    let range = ScopeFilter::new(tenant, date(3, 1), date(3, 3)).unwrap();
    let product = range.clone().with_product(ProductFilter::Product("P".into()));
    for kind in [MetricKind::OrderCount, MetricKind::OrderQuantity, MetricKind::OrderAmount] {
        for path in [SeriesPath::Raw, SeriesPath::View] {
            let result = engine.daily_series(&product, kind, path).await;
            assert!(
                matches!(result, Err(SeriesError::ValueOverflow(_))),
                "{} on {}: {:?}",
                kind,
                path,
                result
            );
        }
    }

    for path in [SeriesPath::Raw, SeriesPath::View] {
        let quantity = engine.daily_series(&range, MetricKind::OrderQuantity, path).await.unwrap();
        let values: Vec<i64> = quantity.iter().map(|m| m.value).collect();
        assert_eq!(values, vec![0, 10_000_000, 0]);
    }
}

#[tokio::test]
async fn test_sentinel_product_code_reads_as_site_wide() {
    let engine = engine_in(Tz::UTC).await;
    let tenant = TenantId::generate();

    engine
        .store()
        .record_visit(NewVisit::new(tenant, "/", HUMAN).at(Utc.with_ymd_and_hms(2024, 3, 2, 9, 0, 0).unwrap()))
        .await
        .unwrap();
    engine
        .store()
        .record_visit(
            NewVisit::new(tenant, "/p/mug", HUMAN)
                .product("MUG")
                .at(Utc.with_ymd_and_hms(2024, 3, 3, 9, 0, 0).unwrap()),
        )
        .await
        .unwrap();
    engine
        .store()
        .record_order(
            NewOrder::new(tenant, 600, "EUR", "mug")
                .line(NewOrderLine::new("MUG", "Mug", 600, 1))
                .at(Utc.with_ymd_and_hms(2024, 3, 3, 10, 0, 0).unwrap()),
        )
        .await
        .unwrap();

    let range = ScopeFilter::new(tenant, date(3, 1), date(3, 3)).unwrap();
    let sentinel = range.clone().with_product(ProductFilter::Product(String::new()));
    let site_wide = range.clone().with_product(ProductFilter::SiteWide);

    for path in [SeriesPath::Raw, SeriesPath::View] {
        let visits = engine.daily_series(&sentinel, MetricKind::VisitCount, path).await.unwrap();
        let values: Vec<i64> = visits.iter().map(|m| m.value).collect();
        assert_eq!(values, vec![0, 1, 0], "{}", path);

        for kind in MetricKind::ALL {
            assert_eq!(
                engine.daily_series(&sentinel, kind, path).await.unwrap(),
                engine.daily_series(&site_wide, kind, path).await.unwrap(),
                "{} on {}",
                kind,
                path
            );
        }

        let orders = engine.daily_series(&sentinel, MetricKind::OrderCount, path).await.unwrap();
        let values: Vec<i64> = orders.iter().map(|m| m.value).collect();
        assert_eq!(values, vec![0, 0, 1], "{}", path);
    }

    assert_eq!(engine.scalars().count(&sentinel, EventKind::Visit).await.unwrap(), 1);
    assert_eq!(engine.scalars().sum_amount(&sentinel).await.unwrap(), 600);
}
