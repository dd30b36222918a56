diesel::table! {
    pending_operations (id) {
        id -> BigInt,
        kind -> Text,
        collection -> Text,
        document_id -> Nullable<Text>,
        payload -> Text,
        owner_id -> Text,
        enqueued_at -> Text,
        retry_count -> Integer,
        last_error -> Nullable<Text>,
    }
}
