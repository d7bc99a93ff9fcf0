use std::collections::HashSet;
use std::path::Path;
use std::sync::Arc;

use metrics::counter;
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde::{Deserialize, Serialize};
use tracing::{info, instrument, warn};
use utoipa::ToSchema;
use validator::Validate;

use crate::entities::quote::{ProjectAnalysis, ProjectComplexity, SelectedOption};
use crate::errors::ServiceError;
use crate::integrations::analyzer::{AnalysisRequest, ProjectAnalyzer};

pub const ESTIMATE_CURRENCY: &str = "USD";

/// A reference-data entry with an additive price (project types, features,
/// technologies). Technology prices may be negative.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
pub struct PricedOption {
    pub code: String,
    pub name: String,
    #[schema(value_type = String)]
    pub price: Decimal,
}

/// A reference-data entry that scales the base price.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
pub struct Multiplier {
    pub code: String,
    pub name: String,
    #[schema(value_type = String)]
    pub multiplier: Decimal,
}

fn default_min_factor() -> Decimal {
    dec!(0.85)
}

fn default_max_factor() -> Decimal {
    dec!(1.25)
}

/// Operator-maintained price tables the calculator reads.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
pub struct EstimateCatalog {
    pub project_types: Vec<PricedOption>,
    #[serde(default)]
    pub categories: Vec<Multiplier>,
    #[serde(default)]
    pub industries: Vec<Multiplier>,
    #[serde(default)]
    pub timelines: Vec<Multiplier>,
    #[serde(default)]
    pub features: Vec<PricedOption>,
    #[serde(default)]
    pub technologies: Vec<PricedOption>,
    #[serde(default = "default_min_factor")]
    #[schema(value_type = String)]
    pub min_factor: Decimal,
    #[serde(default = "default_max_factor")]
    #[schema(value_type = String)]
    pub max_factor: Decimal,
}

fn priced(code: &str, name: &str, price: Decimal) -> PricedOption {
    PricedOption {
        code: code.to_string(),
        name: name.to_string(),
        price,
    }
}

fn scaled(code: &str, name: &str, multiplier: Decimal) -> Multiplier {
    Multiplier {
        code: code.to_string(),
        name: name.to_string(),
        multiplier,
    }
}

impl Default for EstimateCatalog {
    fn default() -> Self {
        Self {
            project_types: vec![
                priced("website", "Website", dec!(2500)),
                priced("web_app", "Web Application", dec!(8000)),
                priced("mobile_app", "Mobile Application", dec!(12000)),
                priced("ecommerce", "E-commerce Platform", dec!(10000)),
                priced("saas", "SaaS Platform", dec!(20000)),
                priced("ai_solution", "AI Solution", dec!(15000)),
            ],
            categories: vec![
                scaled("business", "Business", dec!(1.0)),
                scaled("education", "Education", dec!(0.9)),
                scaled("healthcare", "Healthcare", dec!(1.2)),
                scaled("finance", "Finance", dec!(1.25)),
                scaled("entertainment", "Entertainment", dec!(1.0)),
            ],
            industries: vec![
                scaled("retail", "Retail", dec!(1.0)),
                scaled("technology", "Technology", dec!(1.1)),
                scaled("healthcare", "Healthcare", dec!(1.2)),
                scaled("finance", "Financial Services", dec!(1.3)),
                scaled("nonprofit", "Non-profit", dec!(0.85)),
            ],
            timelines: vec![
                scaled("flexible", "Flexible (3+ months)", dec!(0.9)),
                scaled("standard", "Standard (1-3 months)", dec!(1.0)),
                scaled("rush", "Rush (2-4 weeks)", dec!(1.3)),
                scaled("urgent", "Urgent (under 2 weeks)", dec!(1.5)),
            ],
            features: vec![
                priced("user_auth", "User Authentication", dec!(800)),
                priced("payments", "Payment Processing", dec!(1500)),
                priced("admin_dashboard", "Admin Dashboard", dec!(2000)),
                priced("analytics", "Analytics & Reporting", dec!(1200)),
                priced("notifications", "Notifications", dec!(600)),
                priced("chat", "Real-time Chat", dec!(1800)),
                priced("search", "Search", dec!(900)),
                priced("multilingual", "Multi-language Support", dec!(1000)),
                priced("api_integration", "Third-party API Integration", dec!(1500)),
                priced("ai_assistant", "AI Assistant", dec!(3000)),
                priced("file_uploads", "File Uploads", dec!(500)),
                priced("booking", "Booking & Scheduling", dec!(1400)),
            ],
            technologies: vec![
                priced("react", "React", dec!(0)),
                priced("nextjs", "Next.js", dec!(500)),
                priced("react_native", "React Native", dec!(1500)),
                priced("flutter", "Flutter", dec!(1200)),
                priced("node", "Node.js", dec!(0)),
                priced("rust", "Rust", dec!(2000)),
                priced("python", "Python", dec!(0)),
                priced("postgres", "PostgreSQL", dec!(300)),
                priced("mongodb", "MongoDB", dec!(200)),
                priced("aws", "AWS", dec!(800)),
                priced("wordpress", "WordPress", dec!(-500)),
                priced("no_code", "No-code Platform", dec!(-1500)),
            ],
            min_factor: default_min_factor(),
            max_factor: default_max_factor(),
        }
    }
}

fn check_unique<'a>(table: &str, codes: impl Iterator<Item = &'a str>) -> Result<(), ServiceError> {
    let mut seen = HashSet::new();
    for code in codes {
        if !seen.insert(code) {
            return Err(ServiceError::ValidationError(format!(
                "duplicate code '{}' in catalog {}",
                code, table
            )));
        }
    }
    Ok(())
}

impl EstimateCatalog {
    /// Loads a catalog from a JSON file and checks it.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ServiceError> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path).map_err(|e| {
            ServiceError::InternalError(format!("Cannot read catalog {}: {}", path.display(), e))
        })?;
        let catalog: Self = serde_json::from_str(&raw)?;
        catalog.check()?;
        info!(path = %path.display(), project_types = catalog.project_types.len(), "Loaded estimate catalog");
        Ok(catalog)
    }

    pub fn check(&self) -> Result<(), ServiceError> {
        if self.project_types.is_empty() {
            return Err(ServiceError::ValidationError(
                "catalog needs at least one project type".to_string(),
            ));
        }
        if self.min_factor <= Decimal::ZERO || self.min_factor > self.max_factor {
            return Err(ServiceError::ValidationError(
                "catalog factors need 0 < min_factor <= max_factor".to_string(),
            ));
        }
        check_unique("project_types", self.project_types.iter().map(|o| o.code.as_str()))?;
        check_unique("categories", self.categories.iter().map(|o| o.code.as_str()))?;
        check_unique("industries", self.industries.iter().map(|o| o.code.as_str()))?;
        check_unique("timelines", self.timelines.iter().map(|o| o.code.as_str()))?;
        check_unique("features", self.features.iter().map(|o| o.code.as_str()))?;
        check_unique("technologies", self.technologies.iter().map(|o| o.code.as_str()))
    }
}

fn lookup_priced<'a>(
    table: &'a [PricedOption],
    kind: &str,
    code: &str,
) -> Result<&'a PricedOption, ServiceError> {
    table
        .iter()
        .find(|o| o.code == code)
        .ok_or_else(|| ServiceError::ValidationError(format!("unknown {} code '{}'", kind, code)))
}

fn lookup_multiplier<'a>(
    table: &'a [Multiplier],
    kind: &str,
    code: Option<&str>,
) -> Result<Option<&'a Multiplier>, ServiceError> {
    match code.map(str::trim).filter(|c| !c.is_empty()) {
        None => Ok(None),
        Some(code) => table.iter().find(|m| m.code == code).map(Some).ok_or_else(|| {
            ServiceError::ValidationError(format!("unknown {} code '{}'", kind, code))
        }),
    }
}

/// Selections a client makes on the estimate form.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize, Validate, ToSchema)]
pub struct EstimateInput {
    #[validate(length(min = 1, message = "project_type is required"))]
    pub project_type: String,
    #[serde(default)]
    pub category: Option<String>,
    #[serde(default)]
    pub industry: Option<String>,
    #[serde(default)]
    pub features: Vec<String>,
    #[serde(default)]
    pub technologies: Vec<String>,
    #[serde(default)]
    pub timeline: Option<String>,
    #[serde(default)]
    #[validate(length(max = 5000))]
    pub description: Option<String>,
}

/// A code together with its catalog name.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
pub struct NamedCode {
    pub code: String,
    pub name: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
pub struct EstimateBreakdown {
    #[schema(value_type = String)]
    pub base_cost: Decimal,
    #[schema(value_type = String)]
    pub category_multiplier: Decimal,
    #[schema(value_type = String)]
    pub industry_multiplier: Decimal,
    #[schema(value_type = String)]
    pub timeline_multiplier: Decimal,
    #[schema(value_type = String)]
    pub adjusted_base: Decimal,
    #[schema(value_type = String)]
    pub features_cost: Decimal,
    #[schema(value_type = String)]
    pub technologies_cost: Decimal,
    pub features: Vec<SelectedOption>,
    pub technologies: Vec<SelectedOption>,
}

/// Price range for a set of selections.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
pub struct Estimate {
    #[schema(value_type = String)]
    pub base_estimate: Decimal,
    #[schema(value_type = String)]
    pub min_estimate: Decimal,
    #[schema(value_type = String)]
    pub max_estimate: Decimal,
    pub currency: String,
    pub complexity: ProjectComplexity,
    pub project_type: NamedCode,
    pub category: Option<NamedCode>,
    pub industry: Option<NamedCode>,
    pub timeline: Option<NamedCode>,
    pub breakdown: EstimateBreakdown,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub analysis: Option<ProjectAnalysis>,
}

fn checked_sum(prices: impl Iterator<Item = Decimal>) -> Option<Decimal> {
    prices.fold(Some(Decimal::ZERO), |sum, price| sum?.checked_add(price))
}

fn dedup(codes: &[String]) -> Vec<&str> {
    let mut seen = HashSet::new();
    codes
        .iter()
        .map(|c| c.trim())
        .filter(|c| !c.is_empty() && seen.insert(*c))
        .collect()
}

fn named(m: &Multiplier) -> NamedCode {
    NamedCode {
        code: m.code.clone(),
        name: m.name.clone(),
    }
}

fn selected(o: &PricedOption) -> SelectedOption {
    SelectedOption {
        code: o.code.clone(),
        name: o.name.clone(),
        price: o.price,
    }
}

/// Turns estimate selections into a priced range.
#[derive(Clone)]
pub struct EstimateCalculator {
    catalog: Arc<EstimateCatalog>,
    analyzer: Option<Arc<dyn ProjectAnalyzer>>,
}

impl EstimateCalculator {
    pub fn new(catalog: Arc<EstimateCatalog>, analyzer: Option<Arc<dyn ProjectAnalyzer>>) -> Self {
        Self { catalog, analyzer }
    }

    pub fn catalog(&self) -> &EstimateCatalog {
        &self.catalog
    }

    /// Pure price computation; unknown codes are validation errors.
    pub fn calculate(&self, input: &EstimateInput) -> Result<Estimate, ServiceError> {
        input.validate()?;
        let catalog = &*self.catalog;

        let project_type = lookup_priced(&catalog.project_types, "project type", input.project_type.trim())?;
        let category = lookup_multiplier(&catalog.categories, "category", input.category.as_deref())?;
        let industry = lookup_multiplier(&catalog.industries, "industry", input.industry.as_deref())?;
        let timeline = lookup_multiplier(&catalog.timelines, "timeline", input.timeline.as_deref())?;

        let features = dedup(&input.features)
            .into_iter()
            .map(|code| lookup_priced(&catalog.features, "feature", code).map(selected))
            .collect::<Result<Vec<_>, _>>()?;
        let technologies = dedup(&input.technologies)
            .into_iter()
            .map(|code| lookup_priced(&catalog.technologies, "technology", code).map(selected))
            .collect::<Result<Vec<_>, _>>()?;

        let category_multiplier = category.map_or(Decimal::ONE, |m| m.multiplier);
        let industry_multiplier = industry.map_or(Decimal::ONE, |m| m.multiplier);
        let timeline_multiplier = timeline.map_or(Decimal::ONE, |m| m.multiplier);

        let too_large =
            || ServiceError::ValidationError("estimate amounts are too large".to_string());
        let adjusted_base = project_type
            .price
            .checked_mul(category_multiplier)
            .and_then(|v| v.checked_mul(industry_multiplier))
            .and_then(|v| v.checked_mul(timeline_multiplier))
            .ok_or_else(too_large)?;
        let features_cost = checked_sum(features.iter().map(|f| f.price)).ok_or_else(too_large)?;
        let technologies_cost =
            checked_sum(technologies.iter().map(|t| t.price)).ok_or_else(too_large)?;
        let base_estimate = adjusted_base
            .checked_add(features_cost)
            .and_then(|v| v.checked_add(technologies_cost))
            .ok_or_else(too_large)?
            .max(Decimal::ZERO);
        let min_estimate = base_estimate
            .checked_mul(catalog.min_factor)
            .ok_or_else(too_large)?;
        let max_estimate = base_estimate
            .checked_mul(catalog.max_factor)
            .ok_or_else(too_large)?;

        Ok(Estimate {
            base_estimate: base_estimate.round_dp(2),
            min_estimate: min_estimate.round_dp(2),
            max_estimate: max_estimate.round_dp(2),
            currency: ESTIMATE_CURRENCY.to_string(),
            complexity: ProjectComplexity::from_selection_count(features.len() + technologies.len()),
            project_type: NamedCode {
                code: project_type.code.clone(),
                name: project_type.name.clone(),
            },
            category: category.map(named),
            industry: industry.map(named),
            timeline: timeline.map(named),
            breakdown: EstimateBreakdown {
                base_cost: project_type.price,
                category_multiplier,
                industry_multiplier,
                timeline_multiplier,
                adjusted_base: adjusted_base.round_dp(2),
                features_cost,
                technologies_cost,
                features,
                technologies,
            },
            analysis: None,
        })
    }

    /// Computes the estimate and, when a description is given and an analyzer
    /// is configured, attaches its analysis. Analyzer failures are logged only.
    #[instrument(skip(self, input), fields(project_type = %input.project_type))]
    pub async fn estimate(&self, input: &EstimateInput) -> Result<Estimate, ServiceError> {
        let mut estimate = self.calculate(input)?;

        let description = input
            .description
            .as_deref()
            .map(str::trim)
            .filter(|d| !d.is_empty());
        if let (Some(description), Some(analyzer)) = (description, &self.analyzer) {
            let request = AnalysisRequest {
                description: description.to_string(),
                project_type: estimate.project_type.name.clone(),
                features: estimate.breakdown.features.iter().map(|f| f.name.clone()).collect(),
                technologies: estimate
                    .breakdown
                    .technologies
                    .iter()
                    .map(|t| t.name.clone())
                    .collect(),
            };
            match analyzer.analyze(&request).await {
                Ok(analysis) => estimate.analysis = Some(analysis),
                Err(e) => {
                    warn!(error = %e, "Project analysis failed, returning estimate without it");
                    counter!("estimates.analysis_failed", 1);
                }
            }
        }

        counter!("estimates.computed", 1, "complexity" => estimate.complexity.to_string());
        Ok(estimate)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::integrations::analyzer::MockProjectAnalyzer;
    use assert_matches::assert_matches;

    fn calculator() -> EstimateCalculator {
        EstimateCalculator::new(Arc::new(EstimateCatalog::default()), None)
    }

    fn input(project_type: &str) -> EstimateInput {
        EstimateInput {
            project_type: project_type.to_string(),
            ..Default::default()
        }
    }

    #[test]
    fn catalog_prices_that_overflow_are_rejected() {
        let mut catalog = EstimateCatalog::default();
        catalog.project_types.push(priced("moonshot", "Moonshot", Decimal::MAX));
        let calc = EstimateCalculator::new(Arc::new(catalog), None);

        let mut selection = input("moonshot");
        selection.features = vec!["payments".into()];
        assert_matches!(
            calc.calculate(&selection),
            Err(ServiceError::ValidationError(_))
        );
    }

    #[test]
    fn base_only_uses_unit_multipliers() {
        let estimate = calculator().calculate(&input("web_app")).unwrap();
        assert_eq!(estimate.base_estimate, dec!(8000));
        assert_eq!(estimate.min_estimate, dec!(6800));
        assert_eq!(estimate.max_estimate, dec!(10000));
        assert_eq!(estimate.breakdown.category_multiplier, Decimal::ONE);
        assert_eq!(estimate.complexity, ProjectComplexity::Simple);
        assert_eq!(estimate.currency, "USD");
    }

    #[test]
    fn multipliers_scale_base_before_additions() {
        let estimate = calculator()
            .calculate(&EstimateInput {
                project_type: "website".into(),
                category: Some("healthcare".into()),
                industry: Some("technology".into()),
                timeline: Some("rush".into()),
                features: vec!["payments".into(), "search".into()],
                technologies: vec!["wordpress".into()],
                ..Default::default()
            })
            .unwrap();

        // 2500 * 1.2 * 1.1 * 1.3 = 4290
        assert_eq!(estimate.breakdown.adjusted_base, dec!(4290));
        assert_eq!(estimate.breakdown.features_cost, dec!(2400));
        assert_eq!(estimate.breakdown.technologies_cost, dec!(-500));
        assert_eq!(estimate.base_estimate, dec!(6190));
        assert_eq!(estimate.min_estimate, dec!(5261.50));
        assert_eq!(estimate.max_estimate, dec!(7737.50));
        assert_eq!(estimate.timeline.unwrap().name, "Rush (2-4 weeks)");
    }

    #[test]
    fn negative_technology_impact_floors_at_zero() {
        let mut catalog = EstimateCatalog::default();
        catalog.technologies.push(PricedOption {
            code: "free".into(),
            name: "Freebie".into(),
            price: dec!(-100000),
        });
        let calc = EstimateCalculator::new(Arc::new(catalog), None);
        let estimate = calc
            .calculate(&EstimateInput {
                project_type: "website".into(),
                technologies: vec!["free".into()],
                ..Default::default()
            })
            .unwrap();
        assert_eq!(estimate.base_estimate, Decimal::ZERO);
        assert_eq!(estimate.max_estimate, Decimal::ZERO);
    }

    #[test]
    fn unknown_codes_are_named_in_the_error() {
        assert_matches!(
            calculator().calculate(&input("spaceship")),
            Err(ServiceError::ValidationError(msg)) if msg.contains("spaceship")
        );
        assert_matches!(
            calculator().calculate(&EstimateInput {
                project_type: "website".into(),
                features: vec!["teleport".into()],
                ..Default::default()
            }),
            Err(ServiceError::ValidationError(msg)) if msg.contains("teleport")
        );
        assert_matches!(
            calculator().calculate(&input("")),
            Err(ServiceError::ValidationError(_))
        );
    }

    #[test]
    fn duplicate_selections_count_once_and_drive_complexity() {
        let estimate = calculator()
            .calculate(&EstimateInput {
                project_type: "saas".into(),
                features: vec![
                    "user_auth".into(),
                    "user_auth".into(),
                    "payments".into(),
                    "chat".into(),
                    "search".into(),
                ],
                technologies: vec!["rust".into(), "postgres".into(), "aws".into()],
                ..Default::default()
            })
            .unwrap();
        assert_eq!(estimate.breakdown.features.len(), 4);
        assert_eq!(estimate.complexity, ProjectComplexity::Complex);
    }

    #[tokio::test]
    async fn analyzer_failure_keeps_the_estimate() {
        let mut analyzer = MockProjectAnalyzer::new();
        analyzer
            .expect_analyze()
            .times(1)
            .returning(|_| Err(ServiceError::UpstreamError("timeout".into())));
        let calc = EstimateCalculator::new(
            Arc::new(EstimateCatalog::default()),
            Some(Arc::new(analyzer)),
        );

        let estimate = calc
            .estimate(&EstimateInput {
                project_type: "website".into(),
                description: Some("A site for my bakery".into()),
                ..Default::default()
            })
            .await
            .unwrap();
        assert!(estimate.analysis.is_none());
        assert_eq!(estimate.base_estimate, dec!(2500));
    }

    #[tokio::test]
    async fn analyzer_only_runs_with_a_description() {
        let mut analyzer = MockProjectAnalyzer::new();
        analyzer.expect_analyze().times(1).returning(|_| {
            Ok(ProjectAnalysis {
                summary: "Bakery storefront".into(),
                suggested_features: vec!["booking".into()],
                risk_level: "low".into(),
            })
        });
        let calc = EstimateCalculator::new(
            Arc::new(EstimateCatalog::default()),
            Some(Arc::new(analyzer)),
        );

        let without = calc.estimate(&input("website")).await.unwrap();
        assert!(without.analysis.is_none());

        let with = calc
            .estimate(&EstimateInput {
                project_type: "website".into(),
                description: Some("A site for my bakery".into()),
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(with.analysis.unwrap().risk_level, "low");
    }

    #[test]
    fn catalog_file_round_trip_and_checks() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("catalog.json");
        std::fs::write(
            &path,
            r#"{"project_types":[{"code":"site","name":"Site","price":"1000"}],"max_factor":"1.5"}"#,
        )
        .unwrap();
        let catalog = EstimateCatalog::from_file(&path).unwrap();
        assert_eq!(catalog.min_factor, dec!(0.85));
        assert_eq!(catalog.max_factor, dec!(1.5));

        let mut bad = EstimateCatalog::default();
        bad.features.push(bad.features[0].clone());
        assert_matches!(bad.check(), Err(ServiceError::ValidationError(_)));
    }
}
