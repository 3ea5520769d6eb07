//! PostgreSQL type OID and length mappings
//!
//! Maps the type names reported by the backend driver (`INT4`, `TEXT`,
//! `TIMESTAMPTZ`, `INT4[]`, ...) to wire protocol type identifiers.
//! PostgreSQL OIDs: https://github.com/postgres/postgres/blob/master/src/include/catalog/pg_type.dat

/// Get the PostgreSQL type OID for a given type name
pub fn pg_type_oid(type_name: &str) -> u32 {
    match type_name.to_lowercase().as_str() {
        // === NUMERIC ===
        "int2" | "smallint" => 21,
        "int4" | "integer" | "int" => 23,
        "int8" | "bigint" => 20,
        "float4" | "real" => 700,
        "float8" | "double precision" => 701,
        "numeric" | "decimal" => 1700,
        "money" => 790,
        "oid" => 26,

        // === BOOLEAN ===
        "bool" | "boolean" => 16,

        // === TEXT TYPES ===
        "text" => 25,
        "varchar" | "character varying" => 1043,
        "bpchar" | "character" => 1042,
        "char" => 18,
        "name" => 19,

        // === DATE/TIME ===
        "date" => 1082,
        "time" | "time without time zone" => 1083,
        "timetz" | "time with time zone" => 1266,
        "timestamp" | "timestamp without time zone" => 1114,
        "timestamptz" | "timestamp with time zone" => 1184,
        "interval" => 1186,

        // === MISC ===
        "uuid" => 2950,
        "bytea" => 17,
        "json" => 114,
        "jsonb" => 3802,
        "xml" => 142,
        "inet" => 869,
        "cidr" => 650,
        "macaddr" => 829,
        "bit" => 1560,
        "unknown" => 705,
        "varbit" | "bit varying" => 1562,

        // === ARRAYS ===
        "bool[]" => 1000,
        "int2[]" => 1005,
        "int4[]" => 1007,
        "text[]" => 1009,
        "varchar[]" => 1015,
        "int8[]" => 1016,
        "float4[]" => 1021,
        "float8[]" => 1022,
        "date[]" => 1182,
        "timestamptz[]" => 1185,
        "numeric[]" => 1231,
        "uuid[]" => 2951,
        "jsonb[]" => 3807,

        // Enums, domains and anything else travel as text
        _ => 25,
    }
}

/// Get the PostgreSQL type length for a given type name
/// Returns fixed size for fixed-length types, -1 for variable-length
pub fn pg_type_len(type_name: &str) -> i16 {
    match type_name.to_lowercase().as_str() {
        "bool" | "boolean" | "char" => 1,
        "int2" | "smallint" => 2,
        "int4" | "integer" | "int" | "oid" | "float4" | "real" | "date" => 4,
        "int8" | "bigint" | "float8" | "double precision" | "money" => 8,
        "time" | "time without time zone" => 8,
        "timestamp" | "timestamp without time zone" => 8,
        "timestamptz" | "timestamp with time zone" => 8,
        "timetz" | "time with time zone" => 12,
        "interval" | "uuid" => 16,
        "name" => 64,
        _ => -1,
    }
}
