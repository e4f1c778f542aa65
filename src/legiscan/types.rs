use serde::Deserialize;

/// Response from `GET /?op=getSearch`.
///
/// `searchresult` maps page positions (`"0"`, `"1"`, ...) to hits, plus a
/// `summary` entry describing the page.
#[derive(Deserialize, Debug)]
pub struct SearchResponse {
    pub status: Option<String>,
    pub alert: Option<Alert>,
    #[serde(default)]
    pub searchresult: serde_json::Map<String, serde_json::Value>,
}

#[derive(Deserialize, Debug)]
pub struct Alert {
    pub message: Option<String>,
}

#[derive(Deserialize, Debug)]
pub struct BillHit {
    pub title: Option<String>,
    pub description: Option<String>,
}
