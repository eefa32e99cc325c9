pub const NO_WIDGETS_FALLBACK: &str = "No widget details extracted.";

/// Render the grounded analysis instruction. Deterministic in its inputs.
pub fn build_analysis_prompt(widget_descriptions: &[String], review_snippet: &str) -> String {
    let widget_block = if widget_descriptions.is_empty() {
        NO_WIDGETS_FALLBACK.to_string()
    } else {
        widget_descriptions.join("\n")
    };

    let mut out = String::new();
    out.push('\n');
    out.push_str(
        "Analyze the provided mobile UI screenshot to determine if there is a mismatch between the visual interface and the user's feedback.\n\n",
    );
    out.push_str("**User Review Snippet:**\n");
    out.push_str(&format!("\"{review_snippet}\"\n\n"));
    out.push_str("**Annotated Widget Details:**\n");
    out.push_str("(Refer to the numbered widgets in the image)\n");
    out.push_str(&widget_block);
    out.push_str("\n\n");
    out.push_str("**Your Task:**\n");
    out.push_str("1.  **Identify the User's Core Complaint:** What specific UI element and problem is the user describing?\n");
    out.push_str("2.  **Ground the Complaint:** Locate the relevant widget in the image and its details using the provided annotations.\n");
    out.push_str("3.  **Analyze for Mismatch:** Compare the user's complaint with the visual and structural evidence. Does the UI imply a functionality that the user reports as broken or missing?\n");
    out.push_str("4.  **Provide a Conclusion in JSON format.**\n\n");
    out.push_str("**JSON Output Format:**\n");
    out.push_str("Please provide your final analysis ONLY in the following JSON format. Do not add any text before or after the JSON block.\n");
    out.push_str(SCHEMA_BLOCK);
    out
}

const SCHEMA_BLOCK: &str = r#"{
  "mismatch_detected": "Yes" or "No",
  "confidence_score": <A float between 0.0 and 1.0>,
  "mismatch_type": "<'Non-Functional Element', 'Feature Misrepresentation', 'Visual Glitch', or 'None'>",
  "rationale": "<A concise, step-by-step explanation of your reasoning. Start by identifying the user's claim, then ground it to a widget, and finally explain why it is or is not a mismatch.>",
  "relevant_widget_id": <The number of the most relevant widget, or null>
}
"#;

/// Prepend a model task token (e.g. `<MORE_DETAILED_OCR>`) when configured.
pub fn with_task_prefix(prompt: &str, task_prefix: Option<&str>) -> String {
    match task_prefix.map(str::trim).filter(|p| !p.is_empty()) {
        Some(prefix) => format!("{prefix}{prompt}"),
        None => prompt.to_string(),
    }
}
