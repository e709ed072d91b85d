//! # Seed Data Generator
//!
//! Populates a development database with a small restaurant: a menu that
//! exercises every production destination, a manager and a cashier with
//! known PINs, and opening stock for the tracked products.
//!
//! ## Usage
//! ```bash
//! cargo run -p comanda-db --bin seed
//!
//! # Specify database path
//! cargo run -p comanda-db --bin seed -- --db ./data/comanda.db
//! ```
//!
//! ## Generated Data
//! - Kitchen dishes (no stock tracking)
//! - Bar drinks (tracked stock)
//! - Counter items routed nowhere (delivered on send)
//! - `Gerente` (manager, PIN 1234) and `Caixa` (cashier, PIN 0000)

use argon2::{
    password_hash::{rand_core::OsRng, SaltString},
    Argon2, PasswordHasher,
};
use chrono::Utc;
use comanda_core::{Destination, Employee, MovementKind, Product, Role, DEFAULT_TENANT_ID};
use comanda_db::{Database, DbConfig, MovementRequest};
use std::env;
use uuid::Uuid;

/// (sku, name, price in cents, destination, opening stock)
const MENU: &[(&str, &str, i64, Destination, Option<i64>)] = &[
    ("PF-001", "Feijoada", 5490, Destination::Kitchen, None),
    ("PF-002", "Picanha na chapa", 7990, Destination::Kitchen, None),
    ("PF-003", "X-Burger", 3200, Destination::Kitchen, None),
    ("PF-004", "Porção de fritas", 2800, Destination::Kitchen, None),
    ("PF-005", "Moqueca de peixe", 8900, Destination::Kitchen, None),
    ("BB-001", "Chopp 300ml", 1200, Destination::Bar, Some(200)),
    ("BB-002", "Caipirinha", 2200, Destination::Bar, Some(80)),
    ("BB-003", "Suco de laranja", 1100, Destination::Bar, Some(60)),
    ("BB-004", "Refrigerante lata", 700, Destination::Bar, Some(120)),
    ("CT-001", "Água sem gás", 500, Destination::None, Some(100)),
    ("CT-002", "Pudim", 1400, Destination::None, Some(24)),
];

/// (name, role, PIN)
const STAFF: &[(&str, Role, &str)] = &[
    ("Gerente", Role::Manager, "1234"),
    ("Caixa", Role::Cashier, "0000"),
];

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args: Vec<String> = env::args().collect();

    let mut db_path = String::from("./comanda_dev.db");

    let mut i = 1;
    while i < args.len() {
        match args[i].as_str() {
            "--db" | "-d" => {
                if i + 1 < args.len() {
                    db_path = args[i + 1].clone();
                    i += 1;
                }
            }
            "--help" | "-h" => {
                println!("Comanda Seed Data Generator");
                println!();
                println!("Usage: seed [OPTIONS]");
                println!();
                println!("Options:");
                println!("  -d, --db <PATH>    Database file path (default: ./comanda_dev.db)");
                println!("  -h, --help         Show this help message");
                return Ok(());
            }
            _ => {}
        }
        i += 1;
    }

    println!("🌱 Comanda Seed Data Generator");
    println!("==============================");
    println!("Database: {}", db_path);
    println!();

    let db = Database::new(DbConfig::new(&db_path)).await?;
    println!("✓ Connected to database");
    println!("✓ Migrations applied");

    let existing = db.products().count(DEFAULT_TENANT_ID).await?;
    if existing > 0 {
        println!("⚠ Database already has {} products", existing);
        println!("  Skipping seed to avoid duplicates.");
        println!("  Delete the database file to regenerate.");
        return Ok(());
    }

    println!();
    println!("Creating staff...");
    let mut manager_id = None;
    for (name, role, pin) in STAFF {
        let employee = Employee {
            id: Uuid::new_v4().to_string(),
            tenant_id: DEFAULT_TENANT_ID.to_string(),
            name: name.to_string(),
            role: *role,
            pin_hash: hash_pin(pin)?,
            is_active: true,
            created_at: Utc::now(),
        };
        db.employees().insert(&employee).await?;
        if role.is_manager() {
            manager_id = Some(employee.id.clone());
        }
        println!("  {} ({:?})", name, role);
    }

    println!();
    println!("Creating menu...");
    for (sku, name, price_cents, destination, stock) in MENU {
        let now = Utc::now();
        let product = Product {
            id: Uuid::new_v4().to_string(),
            tenant_id: DEFAULT_TENANT_ID.to_string(),
            sku: sku.to_string(),
            name: name.to_string(),
            price_cents: *price_cents,
            track_stock: stock.is_some(),
            current_stock: 0,
            destination: Some(*destination),
            is_active: true,
            created_at: now,
            updated_at: now,
        };

        if let Err(e) = db.products().insert(&product).await {
            eprintln!("Failed to insert {}: {}", product.sku, e);
            continue;
        }

        // Opening stock goes through the ledger so the count has a history
        if let Some(quantity) = stock {
            db.stock()
                .adjust(&MovementRequest {
                    tenant_id: DEFAULT_TENANT_ID,
                    product_id: &product.id,
                    sale_id: None,
                    kind: MovementKind::Entrance,
                    quantity: *quantity,
                    reason: "estoque inicial",
                    responsible_id: manager_id.as_deref(),
                    approver_id: None,
                })
                .await?;
        }
        println!("  {} {} → {}", sku, name, destination.as_str());
    }

    println!();
    println!("✓ Seed complete!");

    Ok(())
}

fn hash_pin(pin: &str) -> Result<String, Box<dyn std::error::Error>> {
    let salt = SaltString::generate(&mut OsRng);
    let hash = Argon2::default()
        .hash_password(pin.as_bytes(), &salt)
        .map_err(|e| format!("Failed to hash PIN: {}", e))?;
    Ok(hash.to_string())
}
