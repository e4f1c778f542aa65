//! Agent definitions: one declarative entry per pipeline stage.
//!
//! Instructions are templates; `{name}` placeholders are filled from the
//! pipeline state slot of the same name (see [`render`]).

/// Which configured model a stage runs on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModelTier {
    Worker,
    Reasoning,
}

#[derive(Debug)]
pub struct AgentSpec {
    pub name: &'static str,
    pub description: &'static str,
    pub tier: ModelTier,
    pub instruction: &'static str,
    pub output_key: &'static str,
    /// Enable the Google Search grounding tool for this call.
    pub grounded: bool,
    /// Ask the model for an `application/json` response.
    pub json_output: bool,
}

pub const SEARCH_TERMS: &str = "search_terms";
pub const GOOGLE_RESULTS: &str = "google_results";
pub const LEGISCAN_RESULTS: &str = "legiscan_results";
pub const RAW_RESULTS: &str = "raw_results";
pub const TOP_5_RESULTS: &str = "top_5_results";
pub const COMPOSED_RESPONSE: &str = "composed_response";

pub const INTAKE: AgentSpec = AgentSpec {
    name: "intake_agent",
    description: "Extracts key legal search terms from a user's inquiry.",
    tier: ModelTier::Worker,
    instruction: "You are a legal query interpreter.
Your job is to convert a user's legal question into standardized, keyword-based search terms.

Return ONLY a JSON list of keywords (e.g., [\"mold\", \"landlord\", \"rights\"]).
Do not return the original query. Only return the standardized search terms.",
    output_key: SEARCH_TERMS,
    grounded: false,
    json_output: true,
};

pub const WEB_SEARCH: AgentSpec = AgentSpec {
    name: "search_agent",
    description: "Searches for legal guidance using Google Search.",
    tier: ModelTier::Worker,
    instruction: "You are a legal search assistant. Use the search terms {search_terms} to find relevant news, court cases, or policy articles
using Google Search.

Format your final output as a JSON list of objects. Each object should include:
  - \"source\": \"Google\"
  - \"title\": a concise title
  - \"description\": 5-10 sentence summary

Return a maximum of 10 results.
DO NOT include a \"url\" field in your output.",
    output_key: GOOGLE_RESULTS,
    grounded: true,
    // Grounded calls cannot also request a JSON mime type.
    json_output: false,
};

/// The legislative branch calls LegiScan directly; this entry names the
/// stage and its output slot.
pub const LEGISLATION: AgentSpec = AgentSpec {
    name: "legislation_agent",
    description: "Searches for relevant laws and bills using LegiScan.",
    tier: ModelTier::Worker,
    instruction: "",
    output_key: LEGISCAN_RESULTS,
    grounded: false,
    json_output: false,
};

pub const COMBINER: AgentSpec = AgentSpec {
    name: "results_combiner",
    description: "Combines search results from different sources into a single list.",
    tier: ModelTier::Worker,
    instruction: "",
    output_key: RAW_RESULTS,
    grounded: false,
    json_output: false,
};

pub const RERANK: AgentSpec = AgentSpec {
    name: "reranking_agent",
    description: "Reranks raw search results based on user query relevance, recency, and legal impact.",
    tier: ModelTier::Reasoning,
    instruction: "You will be given:
- search_terms: legal terms from the user's query. Use them to judge relevance when re-ranking.
  {search_terms}
- raw_results: a list of legal documents or articles returned by prior search tools.
  {raw_results}

Your job is to select and rerank the **top 5 most helpful results** based on:
- Relevance to the user's question (the search_terms)
- Clarity and usefulness of the results
- Legal authority and trustworthiness

Output a JSON list. For each of the top 5, output an object with:
- \"source\": \"LegiScan\" or \"Google\", copied from the raw result
- \"title\": the title of the raw result, copied exactly
- \"description\": 3-5 sentence explanation of its value

DO NOT include a \"url\" field in your output.
Only use the content from raw_results and search_terms to perform re-ranking.
DO NOT fabricate legal sources.

Today's date is {today}.",
    output_key: TOP_5_RESULTS,
    grounded: false,
    json_output: true,
};

pub const COMPOSER: AgentSpec = AgentSpec {
    name: "composer_agent",
    description: "Composes a helpful, user-friendly legal response based on top-ranked sources.",
    tier: ModelTier::Worker,
    instruction: "You are a legal response composer. Your task is to synthesize information from a curated list of sources into a clear and helpful summary for the user.

You will be given top_5_results, a ranked list of the most relevant legal sources (bills, articles, or court cases):
{top_5_results}

Compose a clear, well-structured response that:
- **Exclusively** uses information from top_5_results.
- Summarizes the key legal guidance for the user in plain language.
- References relevant bills or court cases by name when mentioned in the sources.

**Output Format:**
Your output MUST be a single JSON object with the following structure:
{
  \"reasoning\": \"A brief explanation of how you will construct the summary based on the provided sources. This is for internal validation and will not be shown to the user.\",
  \"summary\": \"A cohesive, user-friendly paragraph that directly answers the user's query based *only* on the information in the sources.\",
  \"sources\": [ an array containing an object for each of the top results, with \"title\" and \"source\" fields ]
}

**Example Output:**
{
  \"reasoning\": \"The user is asking about tenant rights. Source 1 (a state law) and Source 3 (a legal aid article) provide the core answer regarding landlord entry and notice periods. Source 2 provides context on a recent related court case. I will synthesize these points into a summary.\",
  \"summary\": \"In your state, landlords are generally required to provide reasonable notice before entering a rental property, typically 24 hours for non-emergency situations. This is outlined in Civil Code 1954. A recent court case, Smith v. Jones, upheld that repeated violations of this notice period can be considered a breach of the lease agreement.\",
  \"sources\": [
    {\"title\": \"CA Civil Code 1954 - Landlord's Right to Enter a Dwelling Unit\", \"source\": \"LegiScan\"},
    {\"title\": \"Smith v. Jones Ruling on Tenant Privacy\", \"source\": \"Google\"},
    {\"title\": \"Tenant Rights Handbook: A Guide to Renting\", \"source\": \"Google\"}
  ]
}

**Crucial Rules:**
- Do NOT invent legal advice, hallucinate case law, or include any information not present in top_5_results.
- Use titles exactly as they appear in top_5_results.
- Do NOT include a \"url\" field in the sources list.
- Be concise, factual, and supportive.
Current date: {today}.",
    output_key: COMPOSED_RESPONSE,
    grounded: false,
    json_output: true,
};

/// Every stage in execution order.
pub const PIPELINE: [&AgentSpec; 6] = [&INTAKE, &WEB_SEARCH, &LEGISLATION, &COMBINER, &RERANK, &COMPOSER];

/// Prompt asking the model to turn `user_query` into 3-6 search terms.
pub fn standardize_legal_query(user_query: &str) -> String {
    format!(
        "Extract 3-6 legal search terms relevant to this query:\n\"{}\"\n\nReturn only a JSON list of strings like:\n[\"mold\", \"tenant rights\", \"habitability\"]",
        user_query.trim()
    )
}

/// Earlier user questions carried into a follow-up turn.
pub const MAX_EARLIER_QUESTIONS: usize = 5;

/// Prefixes `prompt` with the most recent earlier questions of the
/// conversation so follow-ups like "give me an example" keep their topic.
pub fn with_earlier_questions(prompt: String, earlier: &[String]) -> String {
    if earlier.is_empty() {
        return prompt;
    }
    let recent = &earlier[earlier.len().saturating_sub(MAX_EARLIER_QUESTIONS)..];
    let mut out = String::from("Earlier questions in this conversation:\n");
    for question in recent {
        out.push_str(&format!("- {}\n", question.trim()));
    }
    out.push_str("\nCurrent question:\n");
    out.push_str(&prompt);
    out
}

/// Substitutes each `{name}` placeholder in `template` with its value.
/// Placeholders without a value are left untouched.
pub fn render(template: &str, vars: &[(&str, &str)]) -> String {
    let mut out = template.to_string();
    for (name, value) in vars {
        out = out.replace(&format!("{{{name}}}"), value);
    }
    out
}

pub fn today() -> String {
    chrono::Local::now().format("%Y-%m-%d").to_string()
}
