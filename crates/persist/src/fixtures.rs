//! Shared test fixtures: a small blog schema on a [`MemoryStore`].
//!
//! Post 1 "Hello" owns comments 1 ("first", with rating 1) and 2 ("second"),
//! cover image 1, and tags [2, 1].

use palimpsest_common::{RelationSelector, SubjectId, ValueKind};
use palimpsest_store::{EntityStore, MemoryStore, Record, Schema};

pub fn blog() -> MemoryStore {
    MemoryStore::new()
        .with_schema(
            Schema::new("Post")
                .required("title", ValueKind::Text)
                .attribute("views", ValueKind::Int)
                .has_many("comments", "Comment", "post_id")
                .has_one("cover", "Image", "post_id")
                .many_to_many("tags", "Tag"),
        )
        .with_schema(
            Schema::new("Comment")
                .attribute("body", ValueKind::Text)
                .attribute("post_id", ValueKind::Int)
                .has_many("ratings", "Rating", "comment_id"),
        )
        .with_schema(
            Schema::new("Rating")
                .attribute("stars", ValueKind::Int)
                .attribute("comment_id", ValueKind::Int),
        )
        .with_schema(
            Schema::new("Image")
                .attribute("url", ValueKind::Text)
                .attribute("post_id", ValueKind::Int),
        )
        .with_schema(Schema::new("Tag").attribute("label", ValueKind::Text))
}

pub fn blog_with_post() -> (MemoryStore, Record) {
    let mut store = blog();
    let post = store.insert(Record::new("Post").with("title", "Hello")).expect("post");
    for body in ["first", "second"] {
        store
            .insert(Record::new("Comment").with("body", body).with("post_id", 1i64))
            .expect("comment");
    }
    store
        .insert(Record::new("Rating").with("stars", 5i64).with("comment_id", 1i64))
        .expect("rating");
    store
        .insert(Record::new("Image").with("url", "cover.png").with("post_id", 1i64))
        .expect("image");
    for label in ["rust", "db"] {
        store.insert(Record::new("Tag").with("label", label)).expect("tag");
    }
    let record = store.find("Post", &post).expect("find").expect("post exists");
    store
        .replace_ids(&record, "tags", &[SubjectId::from(2), SubjectId::from(1)])
        .expect("tags");
    store.drain_events();
    (store, record)
}

/// comments (with their ratings), cover and tags.
pub fn full_selector() -> RelationSelector {
    RelationSelector::none()
        .nested("comments", RelationSelector::none().leaf("ratings"))
        .leaf("cover")
        .leaf("tags")
}

pub fn post(store: &MemoryStore, id: i64) -> Record {
    store
        .find("Post", &SubjectId::from(id))
        .expect("find")
        .expect("post exists")
}

pub fn bodies(store: &MemoryStore) -> Vec<String> {
    store
        .all("Comment")
        .iter()
        .filter_map(|c| c.get("body").and_then(|v| v.as_str()).map(str::to_string))
        .collect()
}
