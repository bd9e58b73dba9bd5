// Transition Logging
// Shared banner formatting for work-unit lifecycle messages

use tracing::info;

const BANNER: &str =
    "=======================================================================";

/// Log one lifecycle transition: banner, the variant's rendered body, banner.
///
/// All work-unit kinds go through here so operators can grep transitions
/// uniformly regardless of kind.
pub(crate) fn log_transition(body: &str) {
    info!("\n{}\n{}\n{}", BANNER, body, BANNER);
}

/// Render a transition body from a heading plus identifying fields.
pub(crate) fn render_body(heading: &str, fields: &[(&str, String)]) -> String {
    let mut body = String::from(heading);
    for (name, value) in fields {
        body.push_str("\n  ");
        body.push_str(name);
        body.push_str(" = ");
        body.push_str(value);
    }
    body
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_render_body_lists_fields_in_order() {
        let body = render_body(
            "Started batch job execution",
            &[
                ("Job name", "payroll".to_string()),
                ("JobInstance id", "4".to_string()),
            ],
        );

        assert_eq!(
            body,
            "Started batch job execution\n  Job name = payroll\n  JobInstance id = 4"
        );
    }
}
