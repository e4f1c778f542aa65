use serde::de::DeserializeOwned;

/// Balanced `[...]` / `{...}` spans of model text, in order of appearance.
/// A fenced code block, when present, is searched instead of the whole text.
fn json_candidates(text: &str) -> impl Iterator<Item = &str> {
    let text = fenced_body(text).unwrap_or(text).trim();
    text.char_indices()
        .filter(|(_, c)| matches!(c, '[' | '{'))
        .filter_map(move |(start, _)| {
            let len = balanced_len(&text[start..])?;
            Some(&text[start..start + len])
        })
}

/// Body of the first ``` fenced block. An unterminated fence runs to the end.
fn fenced_body(text: &str) -> Option<&str> {
    let (_, rest) = text.split_once("```")?;
    // Drop the info string ("json") on the opening fence line.
    let (_, body) = rest.split_once('\n')?;
    Some(body.split_once("```").map_or(body, |(inner, _)| inner).trim())
}

/// Byte length of the bracketed value starting at `text[0]`, or `None` when
/// the brackets never balance. String literals are skipped.
fn balanced_len(text: &str) -> Option<usize> {
    let mut stack = Vec::new();
    let mut in_string = false;
    let mut escaped = false;

    for (i, c) in text.char_indices() {
        if in_string {
            match c {
                _ if escaped => escaped = false,
                '\\' => escaped = true,
                '"' => in_string = false,
                _ => {}
            }
            continue;
        }
        match c {
            '"' => in_string = true,
            '[' => stack.push(']'),
            '{' => stack.push('}'),
            ']' | '}' => {
                if stack.pop() != Some(c) {
                    return None;
                }
                if stack.is_empty() {
                    return Some(i + 1);
                }
            }
            _ => {}
        }
    }
    None
}

/// Deserializes the first JSON span in `text` that fits `T`, so citation
/// markers like `[1]` in surrounding prose are passed over.
pub fn parse_model_json<T: DeserializeOwned>(text: &str) -> Result<T, String> {
    let mut first_error = None;
    for candidate in json_candidates(text) {
        match serde_json::from_str(candidate) {
            Ok(value) => return Ok(value),
            Err(e) => {
                first_error.get_or_insert_with(|| format!("{e} in: {}", snippet(candidate)));
            }
        }
    }
    Err(first_error.unwrap_or_else(|| format!("no JSON found in: {}", snippet(text))))
}

fn snippet(text: &str) -> &str {
    if text.len() > 200 {
        &text[..text.floor_char_boundary(200)]
    } else {
        text
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;

    fn first(text: &str) -> Option<&str> {
        json_candidates(text).next()
    }

    #[derive(Debug, Deserialize, PartialEq)]
    struct Hit {
        title: String,
    }

    #[test]
    fn plain_array() {
        assert_eq!(first(r#"["a", "b"]"#), Some(r#"["a", "b"]"#));
    }

    #[test]
    fn fenced_json() {
        let text = "```json\n{\"summary\": \"x\"}\n```";
        assert_eq!(first(text), Some("{\"summary\": \"x\"}"));
    }

    #[test]
    fn fenced_block_wins_over_surrounding_prose() {
        let text = "Sources [1] and [2] below.\n```json\n[{\"title\": \"AB 1\"}]\n```\nSee [3].";
        let hits: Vec<Hit> = parse_model_json(text).unwrap();
        assert_eq!(hits, [Hit { title: "AB 1".into() }]);
    }

    #[test]
    fn prose_around_payload() {
        let text = "Here are the terms:\n[\"landlord\", \"notice\"]\nHope that helps.";
        assert_eq!(first(text), Some("[\"landlord\", \"notice\"]"));
    }

    #[test]
    fn citation_markers_are_skipped() {
        let text = r#"see [1]: [ {"title": "Civil Code 1954"} ] and also [2]"#;
        let hits: Vec<Hit> = parse_model_json(text).unwrap();
        assert_eq!(hits, [Hit { title: "Civil Code 1954".into() }]);
    }

    #[test]
    fn brackets_inside_strings_do_not_close() {
        let text = r#"[{"title": "Rule ] of {thumb"}] trailing ]"#;
        assert_eq!(first(text), Some(r#"[{"title": "Rule ] of {thumb"}]"#));
    }

    #[test]
    fn nothing_to_extract() {
        assert_eq!(first("no json here"), None);
        assert_eq!(first("] backwards ["), None);
        assert!(parse_model_json::<Vec<String>>("no json here").unwrap_err().starts_with("no JSON found"));
    }

    #[test]
    fn parse_reports_bad_payload() {
        let err = parse_model_json::<Vec<String>>("[1, 2]").unwrap_err();
        assert!(err.contains("[1, 2]"), "got: {err}");
    }

    #[test]
    fn parse_typed_list() {
        let terms: Vec<String> = parse_model_json("```\n[\"mold\"]\n```").unwrap();
        assert_eq!(terms, ["mold"]);
    }
}
