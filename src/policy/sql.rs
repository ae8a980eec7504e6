//! Postgres rendering of the policy model.
//!
//! Identifiers come from a validated [`PolicyStore`](super::PolicyStore), so
//! quoting here is belt-and-braces; principal values never appear in DDL.

use super::{PolicyKind, TablePolicy};

/// Session setting carrying the current principal.
pub const CURRENT_USER_SETTING: &str = "app.current_user_id";

/// Table holding the admin identities synced from the application config.
pub const ADMIN_IDENTITIES_TABLE: &str = "app_admin_identities";

/// The admin predicate every policy calls.
pub const IS_ADMIN_SQL: &str = "SELECT app_is_admin()";

pub fn quote_identifier(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

pub fn policy_name(policy: &TablePolicy) -> String {
    format!("{}_owner_isolation", policy.table)
}

/// Users directory plus the helper functions every policy calls.
pub fn helper_statements() -> Vec<String> {
    vec![
        "CREATE TABLE IF NOT EXISTS users (\
            id text PRIMARY KEY, \
            email text NOT NULL UNIQUE, \
            created_at timestamptz NOT NULL DEFAULT now())"
            .to_string(),
        format!("CREATE TABLE IF NOT EXISTS {ADMIN_IDENTITIES_TABLE} (identity text PRIMARY KEY)"),
        format!(
            "CREATE OR REPLACE FUNCTION app_current_user_id() RETURNS text \
             LANGUAGE sql STABLE AS $$ \
             SELECT NULLIF(current_setting('{CURRENT_USER_SETTING}', true), '') $$"
        ),
        format!(
            "CREATE OR REPLACE FUNCTION app_is_admin() RETURNS boolean \
             LANGUAGE sql STABLE SECURITY DEFINER SET search_path = public AS $$ \
             SELECT EXISTS ( \
                 SELECT 1 FROM users u \
                 JOIN {ADMIN_IDENTITIES_TABLE} a ON a.identity = u.email \
                 WHERE u.id = app_current_user_id() \
             ) $$"
        ),
    ]
}

pub fn create_table_sql(policy: &TablePolicy) -> String {
    let owner = quote_identifier(&policy.owner_column);
    let owner_constraint = match policy.kind {
        PolicyKind::Owned => "NOT NULL REFERENCES users(id) ON DELETE CASCADE",
        PolicyKind::AnonymousAllowed => "NULL REFERENCES users(id) ON DELETE SET NULL",
    };
    format!(
        "CREATE TABLE IF NOT EXISTS {table} (\
            id uuid PRIMARY KEY DEFAULT gen_random_uuid(), \
            {owner} text {owner_constraint}, \
            data jsonb NOT NULL DEFAULT '{{}}'::jsonb, \
            created_at timestamptz NOT NULL DEFAULT now(), \
            updated_at timestamptz NOT NULL DEFAULT now())",
        table = quote_identifier(&policy.table),
    )
}

/// Row predicate shared by `USING` and `WITH CHECK`.
pub fn predicate_sql(policy: &TablePolicy) -> String {
    let owner = quote_identifier(&policy.owner_column);
    match policy.kind {
        PolicyKind::Owned => format!("({owner}::text = app_current_user_id() OR app_is_admin())"),
        PolicyKind::AnonymousAllowed => format!(
            "(({owner} IS NOT NULL AND {owner}::text = app_current_user_id()) OR app_is_admin())"
        ),
    }
}

/// Statements that attach the policy and switch enforcement on.
pub fn install_statements(policy: &TablePolicy) -> Vec<String> {
    let table = quote_identifier(&policy.table);
    let name = quote_identifier(&policy_name(policy));
    let predicate = predicate_sql(policy);
    vec![
        format!("ALTER TABLE {table} ENABLE ROW LEVEL SECURITY"),
        format!("ALTER TABLE {table} FORCE ROW LEVEL SECURITY"),
        format!("DROP POLICY IF EXISTS {name} ON {table}"),
        format!("CREATE POLICY {name} ON {table} FOR ALL USING {predicate} WITH CHECK {predicate}"),
    ]
}

/// Enforcement toggle. Touches neither policies nor rows.
pub fn toggle_sql(policy: &TablePolicy, enabled: bool) -> String {
    let verb = if enabled { "ENABLE" } else { "DISABLE" };
    format!("ALTER TABLE {} {} ROW LEVEL SECURITY", quote_identifier(&policy.table), verb)
}

/// Table privileges for the filtered application role. Row access is still
/// decided by the policy.
pub fn grant_sql(policy: &TablePolicy, role: &str) -> String {
    format!(
        "GRANT SELECT, INSERT, UPDATE, DELETE ON {} TO {}",
        quote_identifier(&policy.table),
        quote_identifier(role)
    )
}

/// Bound parameter: `$1` is the table name.
pub const ENFORCEMENT_STATUS_SQL: &str =
    "SELECT relrowsecurity FROM pg_class WHERE oid = to_regclass($1)";

/// Bound parameters: `$1` table name, `$2` policy name.
pub const POLICY_EXISTS_SQL: &str =
    "SELECT EXISTS (SELECT 1 FROM pg_policies WHERE tablename = $1 AND policyname = $2)";
