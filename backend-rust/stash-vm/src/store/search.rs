use rusqlite::params_from_iter;
use std::collections::BTreeSet;

use super::lists::{load_list, readable_list_ids};
use super::things::{load_thing, readable_thing_ids};
use super::{placeholders, Store, StoreResult};
use crate::models::{CompletionType, PropertyCompletion, SearchResults, Thing};

/// `LIKE` pattern matching values that start with `prefix`.
fn prefix_pattern(prefix: &str) -> String {
    let mut pattern = String::with_capacity(prefix.len() + 1);
    for c in prefix.chars() {
        if matches!(c, '%' | '_' | '\\') {
            pattern.push('\\');
        }
        pattern.push(c);
    }
    pattern.push('%');
    pattern
}

fn thing_matches(thing: &Thing, viewer_id: &str, needle: &str) -> bool {
    let contains = |text: &str| text.to_lowercase().contains(needle);
    contains(&thing.name)
        || contains(&thing.description)
        || (thing.owner_id == viewer_id && thing.private_note.as_deref().is_some_and(contains))
}

impl Store {
    // ==================== Search ====================

    /// Case-insensitive substring search over everything the viewer can read.
    ///
    /// Things match on name or description. The private note only counts for
    /// the owner, so a foreign thing is never found through its note.
    pub fn search(&self, viewer_id: &str, query: &str) -> StoreResult<SearchResults> {
        let needle = query.trim().to_lowercase();
        self.read(|conn| {
            let mut things = Vec::new();
            for id in readable_thing_ids(conn, viewer_id)? {
                let thing = load_thing(conn, &id)?;
                if thing_matches(&thing, viewer_id, &needle) {
                    things.push(thing.redacted_for(viewer_id));
                }
            }
            things.sort_by(|a, b| a.name.cmp(&b.name).then_with(|| a.id.cmp(&b.id)));

            let mut lists = Vec::new();
            for id in readable_list_ids(conn, viewer_id)? {
                let list = load_list(conn, &id)?;
                if list.name.to_lowercase().contains(&needle) {
                    lists.push(list);
                }
            }
            lists.sort_by(|a, b| a.name.cmp(&b.name).then_with(|| a.id.cmp(&b.id)));

            Ok(SearchResults { things, lists })
        })
    }

    /// Complete a property name, or with `value` given, a string value of the
    /// property called `name`. Only properties of readable things count.
    pub fn complete_property(
        &self,
        viewer_id: &str,
        name: &str,
        value: Option<&str>,
    ) -> StoreResult<PropertyCompletion> {
        self.read(|conn| {
            let thing_ids: Vec<String> = readable_thing_ids(conn, viewer_id)?.into_iter().collect();
            let completion_type = match value {
                Some(_) => CompletionType::Value,
                None => CompletionType::Name,
            };
            if thing_ids.is_empty() {
                return Ok(PropertyCompletion {
                    completion_type,
                    values: Vec::new(),
                });
            }

            let ids = placeholders(thing_ids.len());
            let (sql, args) = match value {
                None => (
                    format!(
                        r#"SELECT DISTINCT name FROM properties
                           WHERE thing_id IN ({}) AND name LIKE ? ESCAPE '\'"#,
                        ids
                    ),
                    vec![prefix_pattern(name)],
                ),
                Some(value) => (
                    format!(
                        r#"SELECT DISTINCT value_string FROM properties
                           WHERE thing_id IN ({}) AND type = 'string' AND name = ?
                             AND value_string LIKE ? ESCAPE '\'"#,
                        ids
                    ),
                    vec![name.to_string(), prefix_pattern(value)],
                ),
            };

            let mut stmt = conn.prepare(&sql)?;
            let values = stmt
                .query_map(params_from_iter(thing_ids.iter().chain(args.iter())), |row| {
                    row.get::<_, String>(0)
                })?
                .collect::<Result<BTreeSet<_>, _>>()?;

            Ok(PropertyCompletion {
                completion_type,
                values: values.into_iter().collect(),
            })
        })
    }
}
