//! Category task templates.

use crate::models::{ObligationCategory, TaskPriority};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Placeholder for the obligation-type token.
pub const TYPE_PLACEHOLDER: &str = "{obligation_type}";

/// Placeholder for the (truncated) obligation description.
pub const DESCRIPTION_PLACEHOLDER: &str = "{obligation_description}";

/// One task to create for every obligation of a category.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskTemplate {
    /// Title pattern; may contain [`TYPE_PLACEHOLDER`].
    pub title_template: String,
    /// Description pattern; may contain both placeholders.
    pub description_template: String,
    /// Priority before severity escalation.
    pub priority: TaskPriority,
    /// Days from creation to due date before severity scaling.
    pub estimated_days: u32,
}

impl TaskTemplate {
    /// Creates a template.
    #[must_use]
    pub fn new(
        title_template: impl Into<String>,
        description_template: impl Into<String>,
        priority: TaskPriority,
        estimated_days: u32,
    ) -> Self {
        Self {
            title_template: title_template.into(),
            description_template: description_template.into(),
            priority,
            estimated_days,
        }
    }

    /// Fills the title pattern.
    #[must_use]
    pub fn render_title(&self, obligation_type: &str) -> String {
        self.title_template.replace(TYPE_PLACEHOLDER, obligation_type)
    }

    /// Fills the description pattern.
    #[must_use]
    pub fn render_description(&self, obligation_type: &str, description: &str) -> String {
        self.description_template
            .replace(TYPE_PLACEHOLDER, obligation_type)
            .replace(DESCRIPTION_PLACEHOLDER, description)
    }
}

/// Templates keyed by obligation category.
///
/// A category with no templates gets a single generic task per obligation.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TemplateCatalog {
    templates: BTreeMap<ObligationCategory, Vec<TaskTemplate>>,
}

impl TemplateCatalog {
    /// Creates an empty catalog.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// The built-in catalog: three templates for each category.
    #[must_use]
    pub fn standard() -> Self {
        use TaskPriority::{High, Medium};
        Self::new()
            .with_templates(
                ObligationCategory::Reporting,
                vec![
                    TaskTemplate::new(
                        "Prepare {obligation_type} Report",
                        "Gather the data for and prepare the {obligation_type} report this obligation requires: {obligation_description}",
                        High,
                        7,
                    ),
                    TaskTemplate::new(
                        "Review {obligation_type} Report Requirements",
                        "Check every {obligation_type} reporting requirement against the obligation before submission: {obligation_description}",
                        Medium,
                        3,
                    ),
                    TaskTemplate::new(
                        "Submit {obligation_type} Report",
                        "File the finished {obligation_type} report with the responsible regulator as required by: {obligation_description}",
                        High,
                        1,
                    ),
                ],
            )
            .with_templates(
                ObligationCategory::Monitoring,
                vec![
                    TaskTemplate::new(
                        "Establish {obligation_type} Monitoring System",
                        "Put monitoring systems and procedures in place to track compliance with: {obligation_description}",
                        High,
                        14,
                    ),
                    TaskTemplate::new(
                        "Conduct {obligation_type} Monitoring Review",
                        "Review current monitoring practice against the requirements of: {obligation_description}",
                        Medium,
                        5,
                    ),
                    TaskTemplate::new(
                        "Update {obligation_type} Monitoring Procedures",
                        "Bring monitoring procedures and documentation up to date for ongoing compliance with: {obligation_description}",
                        Medium,
                        3,
                    ),
                ],
            )
            .with_templates(
                ObligationCategory::Operational,
                vec![
                    TaskTemplate::new(
                        "Implement {obligation_type} Operational Changes",
                        "Make the operational changes needed to comply with: {obligation_description}",
                        High,
                        21,
                    ),
                    TaskTemplate::new(
                        "Train Staff on {obligation_type} Requirements",
                        "Train the affected staff on the new operational requirements: {obligation_description}",
                        Medium,
                        7,
                    ),
                    TaskTemplate::new(
                        "Audit {obligation_type} Operational Compliance",
                        "Run an internal audit confirming operational compliance with: {obligation_description}",
                        Medium,
                        5,
                    ),
                ],
            )
            .with_templates(
                ObligationCategory::Financial,
                vec![
                    TaskTemplate::new(
                        "Calculate {obligation_type} Financial Requirements",
                        "Work out and prepare the financial requirements for compliance with: {obligation_description}",
                        High,
                        10,
                    ),
                    TaskTemplate::new(
                        "Review {obligation_type} Financial Impact",
                        "Assess the financial impact of meeting the requirements of: {obligation_description}",
                        Medium,
                        5,
                    ),
                    TaskTemplate::new(
                        "Process {obligation_type} Financial Obligations",
                        "Pay the fees, charges, or other amounts due under: {obligation_description}",
                        High,
                        3,
                    ),
                ],
            )
    }

    /// Sets the templates for `category`, replacing any existing ones. An
    /// empty list makes the category fall back to the generic task.
    #[must_use]
    pub fn with_templates(
        mut self,
        category: ObligationCategory,
        templates: Vec<TaskTemplate>,
    ) -> Self {
        self.templates.insert(category, templates);
        self
    }

    /// Returns the templates for `category`.
    #[must_use]
    pub fn templates_for(&self, category: ObligationCategory) -> &[TaskTemplate] {
        self.templates.get(&category).map(Vec::as_slice).unwrap_or(&[])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_standard_catalog_covers_every_category() {
        let catalog = TemplateCatalog::standard();
        for category in [
            ObligationCategory::Reporting,
            ObligationCategory::Monitoring,
            ObligationCategory::Operational,
            ObligationCategory::Financial,
        ] {
            let templates = catalog.templates_for(category);
            assert!((1..=3).contains(&templates.len()), "{category}");
            assert!(templates.iter().all(|t| t.estimated_days > 0));
        }
    }

    #[test]
    fn test_render() {
        let template = TaskTemplate::new(
            "Prepare {obligation_type} Report",
            "{obligation_type}: {obligation_description}",
            TaskPriority::High,
            7,
        );
        assert_eq!(template.render_title("Audit"), "Prepare Audit Report");
        assert_eq!(
            template.render_description("Audit", "file annually"),
            "Audit: file annually"
        );
    }

    #[test]
    fn test_empty_catalog_has_no_templates() {
        let catalog = TemplateCatalog::new();
        assert!(catalog.templates_for(ObligationCategory::Financial).is_empty());
        let catalog =
            TemplateCatalog::standard().with_templates(ObligationCategory::Financial, Vec::new());
        assert!(catalog.templates_for(ObligationCategory::Financial).is_empty());
        assert!(!catalog.templates_for(ObligationCategory::Reporting).is_empty());
    }
}
