use gateway_pricing::config::{DatabaseConfig, PricingConfig};
use gateway_pricing::error::{AppError, CalcError, CurrencyError, LookupError, ValidationError};
use gateway_pricing::pricing::{
    CatalogImporter, Currency, ImportOutcome, NewVendorModel, PriceUpdate, PricingService,
    PricingTier, StrategyKind, TokenBasis, Usage,
};
use rust_decimal::Decimal;
use rust_decimal_macros::dec;

async fn setup() -> anyhow::Result<PricingService> {
    let pool = gateway_pricing::db::connect(&DatabaseConfig {
        path: ":memory:".to_string(),
        max_connections: 1,
    })
    .await?;

    Ok(PricingService::new(
        pool,
        &PricingConfig {
            token_basis: TokenBasis::InputPlusOutput,
            default_currency: Currency::usd(),
            catalog_path: None,
        },
    ))
}

fn tier(number: u32, min: i64, max: Option<i64>, input: &str, output: &str) -> PricingTier {
    PricingTier {
        id: None,
        tier_number: number,
        min_tokens: min,
        max_tokens: max,
        input_per_million_tokens: input.to_string(),
        output_per_million_tokens: output.to_string(),
        cached_input_price: "0.004".to_string(),
    }
}

fn two_tiers() -> Vec<PricingTier> {
    vec![
        tier(1, 0, Some(1_000_000), "0.01", "0.03"),
        tier(2, 1_000_000, None, "0.008", "0.024"),
    ]
}

fn fixed_model(name: &str) -> NewVendorModel {
    NewVendorModel {
        provider_id: 1,
        model_name: name.to_string(),
        pricing_strategy: StrategyKind::Fixed,
        input_per_million_tokens: Some("0.01".to_string()),
        output_per_million_tokens: Some("0.03".to_string()),
        cached_input_price: Some("0.005".to_string()),
        per_request_price: None,
        currency: None,
        enabled: true,
        weight: 100,
        tiers: vec![],
    }
}

fn tiered_model(name: &str) -> NewVendorModel {
    NewVendorModel {
        pricing_strategy: StrategyKind::Tiered,
        tiers: two_tiers(),
        ..fixed_model(name)
    }
}

#[tokio::test]
async fn test_fixed_model_calculation() -> anyhow::Result<()> {
    let service = setup().await?;
    let model = service.create_vendor_model(&fixed_model("gpt-4o")).await?;
    assert_eq!(model.currency, "USD");
    assert_eq!(model.pricing_strategy, "FIXED");

    let calc = service
        .calculate(model.id, &Usage::new(1_000_000, 0, 500_000))
        .await?;
    assert_eq!(calc.input_cost, dec!(0.01));
    assert_eq!(calc.output_cost, dec!(0.015));
    assert_eq!(calc.total_cost, dec!(0.025));

    let calc = service
        .calculate(model.id, &Usage::new(1_000_000, 200_000, 0))
        .await?;
    assert_eq!(calc.input_cost, dec!(0.009));

    let err = service
        .calculate(model.id, &Usage::new(200, 300, 0))
        .await
        .unwrap_err();
    assert!(matches!(err, AppError::Calculation(CalcError::InvalidUsage(_))));
    Ok(())
}

#[tokio::test]
async fn test_per_request_model_calculation() -> anyhow::Result<()> {
    let service = setup().await?;
    let model = service
        .create_vendor_model(&NewVendorModel {
            pricing_strategy: StrategyKind::PerRequest,
            per_request_price: Some("0.10".to_string()),
            ..fixed_model("dall-e-3")
        })
        .await?;

    for usage in [Usage::new(0, 0, 0), Usage::new(5_000_000, 10, 42)] {
        let calc = service.calculate(model.id, &usage).await?;
        assert_eq!(calc.total_cost, dec!(0.10));
        assert_eq!(calc.input_cost, Decimal::ZERO);
        assert_eq!(calc.pricing_strategy, StrategyKind::PerRequest);
    }
    Ok(())
}

#[tokio::test]
async fn test_tiered_model_calculation() -> anyhow::Result<()> {
    let service = setup().await?;
    let model = service.create_vendor_model(&tiered_model("bulk")).await?;
    assert_eq!(model.tiers.len(), 2);
    assert!(model.tiers.iter().all(|t| t.id.is_some()));

    let calc = service
        .calculate(model.id, &Usage::new(1_000_000, 0, 500_000))
        .await?;
    assert_eq!(calc.tier_number, Some(2));
    assert_eq!(calc.input_cost, dec!(0.008));
    assert_eq!(calc.output_cost, dec!(0.012));

    let calc = service.calculate(model.id, &Usage::new(500, 0, 499)).await?;
    assert_eq!(calc.tier_number, Some(1));
    Ok(())
}

#[tokio::test]
async fn test_create_tiered_model_requires_tiers() -> anyhow::Result<()> {
    let service = setup().await?;
    let err = service
        .create_vendor_model(&NewVendorModel {
            tiers: vec![],
            ..tiered_model("empty")
        })
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        AppError::Validation(ValidationError::EmptyTierSet)
    ));
    assert!(service.list_vendor_models(None).await?.is_empty());
    Ok(())
}

#[tokio::test]
async fn test_create_rejects_bad_price_and_currency() -> anyhow::Result<()> {
    let service = setup().await?;

    let err = service
        .create_vendor_model(&NewVendorModel {
            input_per_million_tokens: Some("-1".to_string()),
            ..fixed_model("negative")
        })
        .await
        .unwrap_err();
    assert!(matches!(err, AppError::InvalidPrice { .. }));

    let err = service
        .create_vendor_model(&NewVendorModel {
            currency: Some("DOLLARS".to_string()),
            ..fixed_model("bad-currency")
        })
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        AppError::Currency(CurrencyError::InvalidCode(_))
    ));
    Ok(())
}

#[tokio::test]
async fn test_replace_tiers_is_all_or_nothing() -> anyhow::Result<()> {
    let service = setup().await?;
    let model = service.create_vendor_model(&tiered_model("bulk")).await?;

    // gap between 500 and 600: rejected, stored tiers untouched
    let err = service
        .replace_tiers(
            model.id,
            vec![
                tier(1, 0, Some(500), "1", "2"),
                tier(2, 600, None, "1", "2"),
            ],
        )
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        AppError::Validation(ValidationError::TierGap { .. })
    ));
    let tiers = service.list_tiers(model.id).await?;
    assert_eq!(tiers.len(), 2);
    assert_eq!(tiers[1].min_tokens, 1_000_000);

    // a valid set replaces the old one and gets fresh ids
    let old_ids: Vec<Option<i64>> = tiers.iter().map(|t| t.id).collect();
    let stored = service
        .replace_tiers(
            model.id,
            vec![
                tier(3, 10_000, None, "0.5", "1.5"),
                tier(1, 0, Some(1_000), "1", "3"),
                tier(2, 1_000, Some(10_000), "0.8", "2.4"),
            ],
        )
        .await?;
    let numbers: Vec<u32> = stored.iter().map(|t| t.tier_number).collect();
    assert_eq!(numbers, vec![1, 2, 3]);
    assert!(stored.iter().all(|t| !old_ids.contains(&t.id)));

    let calc = service.calculate(model.id, &Usage::new(5_000, 0, 0)).await?;
    assert_eq!(calc.tier_number, Some(2));
    Ok(())
}

#[tokio::test]
async fn test_replace_tiers_empty_set() -> anyhow::Result<()> {
    let service = setup().await?;

    let tiered = service.create_vendor_model(&tiered_model("bulk")).await?;
    let err = service.replace_tiers(tiered.id, vec![]).await.unwrap_err();
    assert!(matches!(
        err,
        AppError::Validation(ValidationError::EmptyTierSet)
    ));

    let fixed = service
        .create_vendor_model(&NewVendorModel {
            tiers: two_tiers(),
            ..fixed_model("gpt-4o")
        })
        .await?;
    assert_eq!(fixed.tiers.len(), 2);
    assert!(service.replace_tiers(fixed.id, vec![]).await?.is_empty());
    Ok(())
}

#[tokio::test]
async fn test_switching_strategy_keeps_tiers() -> anyhow::Result<()> {
    let service = setup().await?;
    let model = service.create_vendor_model(&tiered_model("bulk")).await?;

    let switched = service
        .update_pricing_strategy(model.id, StrategyKind::Fixed)
        .await?;
    assert_eq!(switched.pricing_strategy, "FIXED");
    assert_eq!(switched.tiers.len(), 2);

    let calc = service
        .calculate(model.id, &Usage::new(1_000_000, 0, 0))
        .await?;
    assert_eq!(calc.pricing_strategy, StrategyKind::Fixed);
    assert_eq!(calc.tier_number, None);

    let back = service
        .update_pricing_strategy(model.id, StrategyKind::Tiered)
        .await?;
    assert_eq!(back.tiers, switched.tiers);
    Ok(())
}

#[tokio::test]
async fn test_switching_into_tiered_without_tiers() -> anyhow::Result<()> {
    let service = setup().await?;
    let model = service.create_vendor_model(&fixed_model("gpt-4o")).await?;

    service
        .update_pricing_strategy(model.id, StrategyKind::Tiered)
        .await?;
    let err = service
        .calculate(model.id, &Usage::new(1, 0, 1))
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        AppError::Calculation(CalcError::Lookup(LookupError::NoTierConfigured))
    ));
    Ok(())
}

#[tokio::test]
async fn test_switching_into_per_request_without_price() -> anyhow::Result<()> {
    let service = setup().await?;
    let model = service.create_vendor_model(&fixed_model("gpt-4o")).await?;

    service
        .update_pricing_strategy(model.id, StrategyKind::PerRequest)
        .await?;
    let err = service
        .calculate(model.id, &Usage::new(1, 0, 1))
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        AppError::Calculation(CalcError::MissingPriceField { .. })
    ));

    service
        .update_prices(
            model.id,
            &PriceUpdate {
                per_request_price: Some("0.02".to_string()),
                ..Default::default()
            },
        )
        .await?;
    let calc = service.calculate(model.id, &Usage::new(1, 0, 1)).await?;
    assert_eq!(calc.total_cost, dec!(0.02));
    Ok(())
}

#[tokio::test]
async fn test_update_prices_keeps_unset_columns() -> anyhow::Result<()> {
    let service = setup().await?;
    let model = service.create_vendor_model(&fixed_model("gpt-4o")).await?;

    let updated = service
        .update_prices(
            model.id,
            &PriceUpdate {
                output_per_million_tokens: Some("0.06".to_string()),
                currency: Some("eur".to_string()),
                ..Default::default()
            },
        )
        .await?;
    assert_eq!(updated.input_per_million_tokens.as_deref(), Some("0.01"));
    assert_eq!(updated.output_per_million_tokens.as_deref(), Some("0.06"));
    assert_eq!(updated.currency, "EUR");

    let err = service
        .update_prices(
            model.id,
            &PriceUpdate {
                cached_input_price: Some("free".to_string()),
                ..Default::default()
            },
        )
        .await
        .unwrap_err();
    assert!(matches!(err, AppError::InvalidPrice { .. }));
    Ok(())
}

#[tokio::test]
async fn test_missing_model() -> anyhow::Result<()> {
    let service = setup().await?;
    assert!(matches!(
        service.get_vendor_model(99).await.unwrap_err(),
        AppError::NotFound(99)
    ));
    assert!(matches!(
        service
            .update_pricing_strategy(99, StrategyKind::Fixed)
            .await
            .unwrap_err(),
        AppError::NotFound(99)
    ));
    assert!(matches!(
        service.replace_tiers(99, two_tiers()).await.unwrap_err(),
        AppError::NotFound(99)
    ));
    assert!(matches!(
        service.delete_vendor_model(99).await.unwrap_err(),
        AppError::NotFound(99)
    ));
    Ok(())
}

#[tokio::test]
async fn test_delete_removes_tiers() -> anyhow::Result<()> {
    let service = setup().await?;
    let model = service.create_vendor_model(&tiered_model("bulk")).await?;

    service.delete_vendor_model(model.id).await?;
    assert!(matches!(
        service.get_vendor_model(model.id).await.unwrap_err(),
        AppError::NotFound(_)
    ));

    let (count,): (i64,) =
        sqlx::query_as("SELECT COUNT(*) FROM pricing_tiers WHERE vendor_model_id = ?")
            .bind(model.id)
            .fetch_one(service.pool())
            .await?;
    assert_eq!(count, 0);
    Ok(())
}

#[tokio::test]
async fn test_list_and_cache() -> anyhow::Result<()> {
    let service = setup().await?;
    service.create_vendor_model(&fixed_model("b-model")).await?;
    service.create_vendor_model(&tiered_model("a-model")).await?;
    service
        .create_vendor_model(&NewVendorModel {
            provider_id: 2,
            ..fixed_model("other")
        })
        .await?;

    let provider_one = service.list_vendor_models(Some(1)).await?;
    let names: Vec<&str> = provider_one.iter().map(|m| m.model_name.as_str()).collect();
    assert_eq!(names, vec!["a-model", "b-model"]);
    assert_eq!(provider_one[0].tiers.len(), 2);

    assert_eq!(service.list_vendor_models(None).await?.len(), 3);
    assert_eq!(service.load_cache().await?, 3);

    let disabled = service.set_enabled(provider_one[1].id, false).await?;
    assert!(!disabled.enabled);
    assert!(!service.get_vendor_model(disabled.id).await?.enabled);
    Ok(())
}

#[tokio::test]
async fn test_calculate_totals_requires_one_currency() -> anyhow::Result<()> {
    let service = setup().await?;
    let usd = service.create_vendor_model(&fixed_model("usd-model")).await?;
    let tiered = service.create_vendor_model(&tiered_model("usd-tiered")).await?;
    let eur = service
        .create_vendor_model(&NewVendorModel {
            currency: Some("EUR".to_string()),
            ..fixed_model("eur-model")
        })
        .await?;

    let totals = service
        .calculate_totals(&[
            (usd.id, Usage::new(1_000_000, 0, 500_000)),
            (tiered.id, Usage::new(1_000_000, 0, 500_000)),
        ])
        .await?;
    assert_eq!(totals.requests, 2);
    assert_eq!(totals.total_cost, dec!(0.045));
    assert_eq!(totals.currency.as_deref(), Some("USD"));

    let err = service
        .calculate_totals(&[
            (usd.id, Usage::new(1, 0, 1)),
            (eur.id, Usage::new(1, 0, 1)),
        ])
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        AppError::Currency(CurrencyError::Mismatch { .. })
    ));
    Ok(())
}

#[tokio::test]
async fn test_concurrent_calculations_agree() -> anyhow::Result<()> {
    let service = std::sync::Arc::new(setup().await?);
    let id = service.create_vendor_model(&tiered_model("bulk")).await?.id;

    let mut handles = Vec::new();
    for _ in 0..8 {
        let service = service.clone();
        handles.push(tokio::spawn(async move {
            service
                .calculate(id, &Usage::new(750_000, 100_000, 400_000))
                .await
        }));
    }

    let mut results = Vec::new();
    for handle in handles {
        results.push(handle.await??);
    }
    assert!(results.windows(2).all(|pair| pair[0] == pair[1]));
    assert_eq!(results[0].tier_number, Some(2));
    Ok(())
}

const CATALOG: &str = r#"{
    "vendorModels": [
        {
            "providerId": 3,
            "modelName": "claude-sonnet",
            "pricingStrategy": "FIXED",
            "inputPerMillionTokens": "3",
            "outputPerMillionTokens": "15",
            "cachedInputPrice": "0.3"
        },
        {
            "providerId": 3,
            "modelName": "image-gen",
            "pricingStrategy": "PER_REQUEST",
            "perRequestPrice": "0.04",
            "weight": 10
        }
    ]
}"#;

#[tokio::test]
async fn test_catalog_import() -> anyhow::Result<()> {
    let service = setup().await?;
    let importer = CatalogImporter::new(&service, Currency::usd());

    let outcome = importer.import_str(CATALOG).await?;
    assert!(matches!(outcome, ImportOutcome::Imported { models: 2, .. }));
    assert_eq!(importer.import_str(CATALOG).await?, ImportOutcome::Unchanged);

    let models = service.list_vendor_models(Some(3)).await?;
    assert_eq!(models.len(), 2);
    assert_eq!(models[1].weight, 10);

    // changed content overwrites the existing rows in place
    let changed = CATALOG.replace("\"15\"", "\"12\"");
    importer.import_str(&changed).await?;
    let models_after = service.list_vendor_models(Some(3)).await?;
    assert_eq!(models_after.len(), 2);
    assert_eq!(models_after[0].id, models[0].id);
    assert_eq!(
        models_after[0].output_per_million_tokens.as_deref(),
        Some("12")
    );

    let calc = service
        .calculate(models_after[0].id, &Usage::new(1_000_000, 0, 1_000_000))
        .await?;
    assert_eq!(calc.total_cost, dec!(15));
    Ok(())
}

#[tokio::test]
async fn test_catalog_import_from_file() -> anyhow::Result<()> {
    let service = setup().await?;
    let dir = tempfile::tempdir()?;
    let path = dir.path().join("catalog.json");
    std::fs::write(&path, CATALOG)?;

    let importer = CatalogImporter::new(&service, Currency::usd());
    let outcome = importer.import_file(&path).await?;
    assert!(matches!(outcome, ImportOutcome::Imported { models: 2, .. }));

    let err = importer
        .import_file(dir.path().join("missing.json"))
        .await
        .unwrap_err();
    assert!(matches!(err, AppError::Catalog(_)));
    Ok(())
}

#[tokio::test]
async fn test_invalid_catalog_writes_nothing() -> anyhow::Result<()> {
    let service = setup().await?;
    let importer = CatalogImporter::new(&service, Currency::usd());

    let invalid = CATALOG.replace("\"0.04\"", "\"-0.04\"");
    assert!(importer.import_str(&invalid).await.is_err());
    assert!(service.list_vendor_models(None).await?.is_empty());
    Ok(())
}

#[tokio::test]
async fn test_calculate_totals_overflow_is_an_error() -> anyhow::Result<()> {
    let service = setup().await?;
    let model = service
        .create_vendor_model(&NewVendorModel {
            pricing_strategy: StrategyKind::PerRequest,
            per_request_price: Some("0.10".to_string()),
            ..fixed_model("dall-e-3")
        })
        .await?;

    let usage = Usage::new(i64::MAX, 0, 0);
    assert_eq!(service.calculate(model.id, &usage).await?.total_cost, dec!(0.10));

    let err = service
        .calculate_totals(&[(model.id, usage), (model.id, usage)])
        .await
        .unwrap_err();
    assert!(matches!(err, AppError::Currency(CurrencyError::Overflow)));
    Ok(())
}

#[tokio::test]
async fn test_calculate_with_cumulative_basis() -> anyhow::Result<()> {
    let service = setup().await?;
    let model = service.create_vendor_model(&tiered_model("bulk")).await?;
    let usage = Usage::new(500, 0, 500);

    let calc = service.calculate(model.id, &usage).await?;
    assert_eq!(calc.tier_number, Some(1));

    // the period total picks the tier, the request's own tokens are billed
    let calc = service
        .calculate_with_basis(model.id, &usage, TokenBasis::Cumulative(2_000_000))
        .await?;
    assert_eq!(calc.tier_number, Some(2));
    assert_eq!(calc.input_cost, dec!(0.000004));
    assert_eq!(calc.output_cost, dec!(0.000012));
    Ok(())
}

#[tokio::test]
async fn test_corrupt_rows_are_reported() -> anyhow::Result<()> {
    let service = setup().await?;
    let model = service.create_vendor_model(&tiered_model("bulk")).await?;

    sqlx::query("UPDATE pricing_tiers SET tier_number = -1 WHERE vendor_model_id = ? AND tier_number = 2")
        .bind(model.id)
        .execute(service.pool())
        .await?;
    let err = service.list_vendor_models(None).await.unwrap_err();
    assert!(matches!(err, AppError::Database(_)), "{:?}", err);

    sqlx::query("UPDATE pricing_tiers SET tier_number = 2 WHERE vendor_model_id = ? AND tier_number = -1")
        .bind(model.id)
        .execute(service.pool())
        .await?;
    sqlx::query("UPDATE vendor_models SET weight = -1 WHERE id = ?")
        .bind(model.id)
        .execute(service.pool())
        .await?;
    let err = service.load_cache().await.unwrap_err();
    assert!(matches!(err, AppError::Database(_)), "{:?}", err);
    Ok(())
}

#[tokio::test]
async fn test_catalog_import_is_atomic() -> anyhow::Result<()> {
    let service = setup().await?;
    let importer = CatalogImporter::new(&service, Currency::usd());

    sqlx::query(
        r#"
        CREATE TRIGGER reject_image_gen BEFORE INSERT ON vendor_models
        WHEN NEW.model_name = 'image-gen'
        BEGIN SELECT RAISE(ABORT, 'rejected'); END
        "#,
    )
    .execute(service.pool())
    .await?;

    let err = importer.import_str(CATALOG).await.unwrap_err();
    assert!(matches!(err, AppError::Database(_)), "{:?}", err);
    assert!(service.list_vendor_models(None).await?.is_empty());

    // no hash was recorded, so the same content imports once the store accepts it
    sqlx::query("DROP TRIGGER reject_image_gen")
        .execute(service.pool())
        .await?;
    let outcome = importer.import_str(CATALOG).await?;
    assert!(matches!(outcome, ImportOutcome::Imported { models: 2, .. }));
    assert_eq!(service.list_vendor_models(Some(3)).await?.len(), 2);
    Ok(())
}
