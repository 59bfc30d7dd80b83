// @generated shape, hand-maintained to match migrations/core.

diesel::table! {
    upload_records (id) {
        id -> Text,
        fingerprint -> Text,
        file_name -> Text,
        file_path -> Text,
        file_size -> BigInt,
        content_type -> Text,
        chunk_size -> BigInt,
        status -> Text,
        uploaded_indices -> Text,
        attempt_counts -> Text,
        priority -> Integer,
        sequence -> BigInt,
        created_at -> BigInt,
        updated_at -> BigInt,
        last_error_kind -> Nullable<Text>,
        last_error_message -> Nullable<Text>,
        last_error_at -> Nullable<BigInt>,
        result_url -> Nullable<Text>,
        version -> Integer,
        checksum -> Text,
    }
}

diesel::table! {
    queue_meta (id) {
        id -> Integer,
        created_at -> BigInt,
        total_processed -> BigInt,
        success_count -> BigInt,
        failure_count -> BigInt,
        schema_version -> Integer,
        next_sequence -> BigInt,
    }
}
