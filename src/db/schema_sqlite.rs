// SQLite schema definitions
// This file mirrors schema.rs but uses SQLite-compatible types

diesel::table! {
    crosspost_links (id) {
        id -> Integer,
        owner_id -> BigInt,
        telegram_chat_id -> BigInt,
        max_channel_id -> Text,
        enabled -> Bool,
        created_at -> Text,
        updated_at -> Text,
    }
}

diesel::table! {
    delivery_records (id) {
        id -> Integer,
        link_id -> BigInt,
        source_post_id -> BigInt,
        max_message_id -> Nullable<Text>,
        status -> Text,
        kind -> Nullable<Text>,
        error -> Nullable<Text>,
        latency_ms -> Nullable<BigInt>,
        created_at -> Text,
        sent_at -> Nullable<Text>,
    }
}

diesel::table! {
    dead_letters (id) {
        id -> Integer,
        link_id -> BigInt,
        source_post_id -> BigInt,
        error -> Text,
        retry_count -> Integer,
        last_retry_at -> Nullable<Text>,
        created_at -> Text,
        resolved_at -> Nullable<Text>,
    }
}

diesel::allow_tables_to_appear_in_same_query!(crosspost_links, delivery_records, dead_letters);
