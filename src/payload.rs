use crate::model::{ChangeAction, ChangeRecord};
use chrono::NaiveDateTime;
use serde_json::{json, Value};

/// Local timestamps render without an offset, GMT ones as UTC. The zero-date
/// sentinel arrives as `None` and renders as `null`.
fn local_date(ts: Option<NaiveDateTime>) -> Value {
    match ts {
        Some(ts) => Value::String(ts.format("%Y-%m-%dT%H:%M:%S").to_string()),
        None => Value::Null,
    }
}

fn gmt_date(ts: Option<NaiveDateTime>) -> Value {
    match ts {
        Some(ts) => Value::String(ts.format("%Y-%m-%dT%H:%M:%SZ").to_string()),
        None => Value::Null,
    }
}

/// The `item` object of a notification.
pub fn render_item(record: &ChangeRecord) -> Value {
    let c = &record.content;
    // A missing local date falls back to the GMT one.
    let date = c.date.or(c.date_gmt);
    let modified = c.modified.or(c.modified_gmt);

    let author = match &record.author {
        Some(a) => json!({
            "login": a.login,
            "nicename": a.nicename,
            "url": a.url,
            "display_name": a.display_name,
        }),
        None => Value::Null,
    };

    json!({
        "id": c.id,
        "date": local_date(date),
        "date_gmt": gmt_date(c.date_gmt),
        "guid": {
            "rendered": c.guid,
            "raw": c.guid,
        },
        "modified": local_date(modified),
        "modified_gmt": gmt_date(c.modified_gmt),
        "password": c.password,
        "slug": c.slug,
        "status": c.status,
        "type": c.content_type,
        "link": record.permalink,
        "featured_image": record.featured_image,
        "author": author,
    })
}

/// Full notification body: `{ "action": ..., "item": ... }`.
pub fn build_notification_body(action: ChangeAction, record: &ChangeRecord) -> Value {
    json!({
        "action": action.as_str(),
        "item": render_item(record),
    })
}
