use diesel::{table, allow_tables_to_appear_in_same_query};

table! {
    tenant_sessions (tenant_id) {
        tenant_id -> Text,
        state -> Text,
        pairing_payload -> Nullable<Text>,
        pairing_image -> Nullable<Text>,
        last_error -> Nullable<Text>,
        requested_at -> Timestamptz,
        pairing_started_at -> Nullable<Timestamptz>,
        connected_at -> Nullable<Timestamptz>,
        disconnected_at -> Nullable<Timestamptz>,
        updated_at -> Timestamptz,
    }
}

table! {
    outbound_messages (id) {
        id -> BigInt,
        tenant_id -> Text,
        recipient -> Text,
        body -> Text,
        status -> Text,
        error -> Nullable<Text>,
        created_at -> Timestamptz,
        updated_at -> Timestamptz,
        sent_at -> Nullable<Timestamptz>,
    }
}

table! {
    inbound_messages (id) {
        id -> BigInt,
        tenant_id -> Text,
        sender -> Text,
        body -> Text,
        received_at -> Timestamptz,
    }
}

allow_tables_to_appear_in_same_query!(
    tenant_sessions,
    outbound_messages,
    inbound_messages,
);
