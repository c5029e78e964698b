diesel::table! {
    appointments (id) {
        id -> Uuid,
        slot_id -> Uuid,
        patient_name -> Varchar,
        contact -> Varchar,
        reason -> Nullable<Text>,
        status -> Varchar,
        reference -> Varchar,
        created_at -> Timestamptz,
        updated_at -> Timestamptz,
    }
}

diesel::table! {
    sessions (token) {
        token -> Varchar,
        user_id -> Uuid,
        expires_at -> Timestamptz,
        created_at -> Timestamptz,
    }
}

diesel::table! {
    slots (id) {
        id -> Uuid,
        start_at -> Timestamptz,
        end_at -> Timestamptz,
        doctor -> Varchar,
        status -> Varchar,
        created_at -> Timestamptz,
        updated_at -> Timestamptz,
    }
}

diesel::table! {
    users (id) {
        id -> Uuid,
        username -> Varchar,
        password_hash -> Varchar,
        role -> Varchar,
        created_at -> Timestamptz,
    }
}

diesel::joinable!(appointments -> slots (slot_id));
diesel::joinable!(sessions -> users (user_id));

diesel::allow_tables_to_appear_in_same_query!(
    appointments,
    sessions,
    slots,
    users,
);
