use anyhow::Result;
use mutfeat::config::{default_recognized_features, MapperConfig};
use mutfeat::counts::column_names;
use mutfeat::dataset::take_rows;
use mutfeat::mapper::FeatureMapper;
use mutfeat::{FeatureIntervalResolver, MutFeatError, TransformLayout};
use polars::prelude::*;

const OPERATOR_COLUMNS: [&str; 11] = [
    "mutationOperator",
    "mutationOperatorGroup",
    "nodeContextBasic",
    "astContextBasic",
    "astContextDetailed",
    "astStmtContextBasic",
    "astStmtContextDetailed",
    "parentContextBasic",
    "parentContextDetailed",
    "parentStmtContextBasic",
    "parentStmtContextDetailed",
];

/// Mutants with every column the full mapper consumes
fn mutants() -> Result<DataFrame> {
    let n = 12;
    let mut columns = vec![
        Column::new(
            "lineRatio".into(),
            (0..n)
                .map(|i| if i == 3 { None } else { Some(i as f64 / n as f64) })
                .collect::<Vec<_>>(),
        ),
        Column::new(
            "nodeTypeBasic".into(),
            (0..n)
                .map(|i| if i % 5 == 0 { None } else { Some(["Expr", "Stmt"][i % 2]) })
                .collect::<Vec<_>>(),
        ),
        Column::new(
            "nodeTypeDetailed".into(),
            (0..n)
                .map(|i| ["BinaryExpr", "IfStmt", "Return"][i % 3])
                .collect::<Vec<_>>(),
        ),
    ];
    for (k, name) in ["nestingIf", "nestingLoop", "nestingTotal", "maxNestingInSameMethod"]
        .iter()
        .enumerate()
    {
        columns.push(Column::new(
            (*name).into(),
            (0..n).map(|i| ((i + k) % 4) as i64).collect::<Vec<_>>(),
        ));
    }
    for name in ["nestingRatioLoop", "nestingRatioIf", "nestingRatioTotal"] {
        columns.push(Column::new(
            name.into(),
            (0..n).map(|i| (i % 3) as f64 / 2.0).collect::<Vec<_>>(),
        ));
    }
    for name in ["hasOperatorChild", "hasVariableChild", "hasLiteralChild"] {
        columns.push(Column::new(
            name.into(),
            (0..n).map(|i| i % 2 == 0).collect::<Vec<_>>(),
        ));
    }
    for (k, name) in OPERATOR_COLUMNS.iter().enumerate() {
        // Column k has k % 4 + 2 distinct values
        let distinct = k % 4 + 2;
        columns.push(Column::new(
            (*name).into(),
            (0..n)
                .map(|i| format!("{}{}", name, i % distinct))
                .collect::<Vec<_>>(),
        ));
    }
    columns.push(Column::new(
        "pKillsDom".into(),
        (0..n).map(|i| i as f64 / 20.0).collect::<Vec<_>>(),
    ));
    Ok(DataFrame::new(columns)?)
}

#[test]
fn test_resolver_agrees_with_mapper_layout() -> Result<()> {
    let df = mutants()?;
    let mapper = FeatureMapper::fit(&df, &MapperConfig::all_features())?;
    let transformed = mapper.transform(&df)?;
    let names = column_names(&transformed);
    assert_eq!(names, mapper.output_names());

    let resolver = FeatureIntervalResolver::new(default_recognized_features());
    resolver.check_layout(&names, &df)?;

    for feature in default_recognized_features() {
        let by_name = resolver.resolve(&names, &df, &feature)?;
        let by_layout = mapper.interval(&feature)?;
        assert_eq!(by_name, by_layout, "feature {}", feature);
    }
    assert_eq!(mapper.total_width(), transformed.width());
    Ok(())
}

#[test]
fn test_known_offsets() -> Result<()> {
    let df = mutants()?;
    let mapper = FeatureMapper::fit(&df, &MapperConfig::all_features())?;
    let names = mapper.output_names();
    let resolver = FeatureIntervalResolver::new(default_recognized_features());

    // lineRatio, 4 nesting counts, 6 ratios/flags precede the node types
    let basic = resolver.resolve(&names, &df, "nodeTypeBasic")?;
    assert_eq!(basic.start, 11);
    // Expr, Stmt and the imputed missing value
    assert_eq!(basic.len(), 3);

    let detailed = resolver.resolve(&names, &df, "nodeTypeDetailed")?;
    assert_eq!(detailed.start, basic.end);
    assert_eq!(detailed.len(), 3);

    let op = resolver.resolve(&names, &df, "mutationOperator")?;
    assert_eq!(op.start, detailed.end);
    assert_eq!(op.len(), 2);
    Ok(())
}

#[test]
fn test_counts_from_other_rows_are_flagged() -> Result<()> {
    let df = mutants()?;
    let mapper = FeatureMapper::fit(&df, &MapperConfig::all_features())?;
    let names = mapper.output_names();
    let resolver = FeatureIntervalResolver::new(default_recognized_features());

    let few = take_rows(&df, &[0, 1])?;
    let err = resolver
        .resolve(&names, &few, "parentStmtContextDetailed")
        .unwrap_err();
    assert!(matches!(err, MutFeatError::LayoutMismatch { .. }));
    Ok(())
}

#[test]
fn test_unknown_feature_is_reported() -> Result<()> {
    let df = mutants()?;
    let mapper = FeatureMapper::fit(&df, &MapperConfig::few_features())?;
    let resolver = FeatureIntervalResolver::new(default_recognized_features());

    let err = resolver
        .resolve(&mapper.output_names(), &df, "lineRatio")
        .unwrap_err();
    assert!(matches!(err, MutFeatError::FeatureNotFound(ref f) if f == "lineRatio"));
    Ok(())
}
