// SQLite schema definitions, kept in sync with the statements in manager.rs

diesel::table! {
    control_rooms (owner_user_id) {
        owner_user_id -> Text,
        room_id -> Text,
        access_token -> Nullable<Text>,
        pending_rename -> Bool,
        created_at -> Text,
    }
}

diesel::table! {
    monitored_rooms (room_id) {
        room_id -> Text,
        mimic_user_id -> Nullable<Text>,
        created_at -> Text,
    }
}

diesel::table! {
    response_modes (id) {
        id -> Integer,
        mimic_user_id -> Text,
        room_id -> Nullable<Text>,
        replace_original -> Bool,
    }
}

diesel::table! {
    blacklists (id) {
        id -> Integer,
        mimic_user_id -> Text,
        room_id -> Nullable<Text>,
        pattern -> Text,
    }
}

diesel::table! {
    reply_links (id) {
        id -> Integer,
        control_room_id -> Text,
        event_id -> Text,
        target_room_id -> Text,
    }
}

diesel::table! {
    latest_reply_links (control_room_id) {
        control_room_id -> Text,
        event_id -> Text,
    }
}

diesel::table! {
    generated_messages (event_id) {
        event_id -> Text,
        room_id -> Text,
        created_at -> Text,
    }
}

diesel::table! {
    transactions (txn_id) {
        txn_id -> Text,
        received_at -> Text,
    }
}

diesel::table! {
    transaction_events (txn_id, event_idx) {
        txn_id -> Text,
        event_idx -> Integer,
        committed_at -> Text,
    }
}

diesel::allow_tables_to_appear_in_same_query!(
    control_rooms,
    monitored_rooms,
    response_modes,
    blacklists,
    reply_links,
    latest_reply_links,
    generated_messages,
    transactions,
    transaction_events,
);
