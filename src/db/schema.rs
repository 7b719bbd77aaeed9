diesel::table! {
    crosspost_links (id) {
        id -> BigInt,
        owner_id -> BigInt,
        telegram_chat_id -> BigInt,
        max_channel_id -> Text,
        enabled -> Bool,
        created_at -> Timestamptz,
        updated_at -> Timestamptz,
    }
}

diesel::table! {
    delivery_records (id) {
        id -> BigInt,
        link_id -> BigInt,
        source_post_id -> BigInt,
        max_message_id -> Nullable<Text>,
        status -> Text,
        kind -> Nullable<Text>,
        error -> Nullable<Text>,
        latency_ms -> Nullable<BigInt>,
        created_at -> Timestamptz,
        sent_at -> Nullable<Timestamptz>,
    }
}

diesel::table! {
    dead_letters (id) {
        id -> BigInt,
        link_id -> BigInt,
        source_post_id -> BigInt,
        error -> Text,
        retry_count -> Integer,
        last_retry_at -> Nullable<Timestamptz>,
        created_at -> Timestamptz,
        resolved_at -> Nullable<Timestamptz>,
    }
}

diesel::allow_tables_to_appear_in_same_query!(crosspost_links, delivery_records, dead_letters);
