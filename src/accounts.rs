#![cfg(not(tarpaulin_include))]
#![cfg(feature = "web")]

use crate::auth::LoginResponse;
use argon2::{
    Argon2,
    password_hash::{PasswordHash, PasswordHasher, PasswordVerifier, SaltString, rand_core::OsRng},
};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs::{File, create_dir_all};
use std::io::{Read, Write};
use std::path::PathBuf;
use uuid::Uuid;

/// User data structure representing a registered application user
///
/// Contains the profile attributes that end up in the login response,
/// plus the credential hash. Stored in the users file keyed by username.
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct Account {
    /// Opaque unique identifier, assigned at registration
    pub user_id: String,

    /// Username (unique identifier for the user)
    pub username: String,

    /// Email address (unique across accounts)
    pub email: String,

    /// Phone number (optional profile data)
    #[serde(default)]
    pub phone: String,

    /// Display name (optional profile data)
    #[serde(default)]
    pub full_name: String,

    /// Role name, "admin" or "user"
    pub role: String,

    /// Argon2 hash of the user's password
    pub password_hash: String,
}

impl Account {
    /// The loosely-shaped response consumed by the auth coordinator's
    /// normalization step.
    pub fn to_login_response(&self) -> LoginResponse {
        LoginResponse {
            user_id: Some(serde_json::Value::String(self.user_id.clone())),
            username: Some(self.username.clone()),
            user_role: Some(self.role.clone()),
            email: Some(self.email.clone()),
            phone: Some(self.phone.clone()),
            full_name: Some(self.full_name.clone()),
            ..LoginResponse::default()
        }
    }
}

/// Credential data for login and registration
///
/// Used to receive login and registration form data from the client.
#[derive(Debug, Serialize, Deserialize)]
pub struct Credentials {
    /// Username for login/registration
    pub username: String,

    /// Email address (optional for login, required for registration)
    #[serde(default)]
    pub email: String,

    /// Phone number (optional)
    #[serde(default)]
    pub phone: String,

    /// Display name (optional)
    #[serde(default)]
    pub full_name: String,

    /// Password in plaintext (only transmitted, never stored)
    pub password: String,
}

const USERS_FILE: &str = "users.json";

/// File-backed account database.
///
/// One JSON file maps usernames to accounts. All operations read and
/// rewrite the whole file; fine at this scale.
pub struct AccountStore {
    dir: PathBuf,
}

impl AccountStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        AccountStore { dir: dir.into() }
    }

    fn users_path(&self) -> PathBuf {
        self.dir.join(USERS_FILE)
    }

    /// Initialize the database structure
    ///
    /// Creates the database directory and users file if they don't exist.
    /// This should be called before any other database operations.
    ///
    /// # Returns
    /// * `std::io::Result<()>` - Success or an IO error
    pub fn init_database(&self) -> std::io::Result<()> {
        if !self.dir.exists() {
            create_dir_all(&self.dir)?;
        }

        let users_path = self.users_path();
        if !users_path.exists() {
            let mut file = File::create(users_path)?;
            file.write_all(b"{}")?;
        }

        Ok(())
    }

    /// Get all registered users
    ///
    /// Reads the users file and returns a map of all registered accounts.
    ///
    /// # Returns
    /// * `Result<HashMap<String, Account>, String>` - Map of usernames to accounts, or an error
    ///
    /// # Errors
    /// * Returns an error if the users file cannot be opened, read, or parsed
    pub fn get_users(&self) -> Result<HashMap<String, Account>, String> {
        let mut file = match File::open(self.users_path()) {
            Ok(file) => file,
            Err(_) => return Err("Failed to open users file".to_string()),
        };

        let mut contents = String::new();
        if file.read_to_string(&mut contents).is_err() {
            return Err("Failed to read users file".to_string());
        }

        match serde_json::from_str(&contents) {
            Ok(users) => Ok(users),
            Err(_) => Err("Failed to parse users data".to_string()),
        }
    }

    /// Save the users map to disk
    ///
    /// # Arguments
    /// * `users` - The users map to save
    ///
    /// # Returns
    /// * `Result<(), String>` - Success or an error message
    pub fn save_users(&self, users: &HashMap<String, Account>) -> Result<(), String> {
        let json = match serde_json::to_string_pretty(users) {
            Ok(json) => json,
            Err(_) => return Err("Failed to serialize users data".to_string()),
        };

        let mut file = match File::create(self.users_path()) {
            Ok(file) => file,
            Err(_) => return Err("Failed to create users file".to_string()),
        };

        if file.write_all(json.as_bytes()).is_err() {
            return Err("Failed to write users data".to_string());
        }

        Ok(())
    }

    /// Register a new user
    ///
    /// Creates a new account with the "user" role. The password is hashed
    /// before storage.
    ///
    /// # Arguments
    /// * `credentials` - Username, email, password and optional profile data
    ///
    /// # Returns
    /// * `Result<Account, String>` - The created account or an error message
    ///
    /// # Errors
    /// * Returns an error if the username or email is already in use
    /// * Returns an error if any required field is empty
    pub fn register_user(&self, credentials: &Credentials) -> Result<Account, String> {
        self.create_account(credentials, "user")
    }

    fn create_account(&self, credentials: &Credentials, role: &str) -> Result<Account, String> {
        if credentials.username.is_empty()
            || credentials.password.is_empty()
            || credentials.email.is_empty()
        {
            return Err("Username, email and password cannot be empty".to_string());
        }

        let mut users = self.get_users()?;
        if users.contains_key(&credentials.username) {
            return Err("Username already exists".to_string());
        }

        if users.values().any(|user| user.email == credentials.email) {
            return Err("Email address is already registered".to_string());
        }

        let password_hash = hash_password(&credentials.password)?;

        let account = Account {
            user_id: Uuid::new_v4().to_string(),
            username: credentials.username.clone(),
            email: credentials.email.clone(),
            phone: credentials.phone.clone(),
            full_name: credentials.full_name.clone(),
            role: role.to_string(),
            password_hash,
        };

        users.insert(account.username.clone(), account.clone());
        self.save_users(&users)?;

        Ok(account)
    }

    /// Verify user credentials
    ///
    /// # Arguments
    /// * `username` - Username to verify
    /// * `password` - Password to verify
    ///
    /// # Returns
    /// * `Result<Option<Account>, String>` - The account when credentials
    ///   are valid, `None` when they are not, or an error
    pub fn verify_user(&self, username: &str, password: &str) -> Result<Option<Account>, String> {
        let users = self.get_users()?;

        if let Some(account) = users.get(username) {
            if verify_password(password, &account.password_hash)? {
                return Ok(Some(account.clone()));
            }
        }
        Ok(None)
    }

    /// Create the bootstrap admin account when no admin exists yet.
    ///
    /// # Arguments
    /// * `password` - Password for the bootstrap account
    pub fn ensure_admin_account(&self, password: &str) -> Result<(), String> {
        let users = self.get_users()?;
        if users.values().any(|user| user.role == "admin") {
            return Ok(());
        }

        self.create_account(
            &Credentials {
                username: "admin".to_string(),
                email: "admin@localhost".to_string(),
                phone: String::new(),
                full_name: "Administrator".to_string(),
                password: password.to_string(),
            },
            "admin",
        )?;
        log::info!("created bootstrap admin account");
        Ok(())
    }
}

/// Hash a password using Argon2
///
/// # Errors
/// * Returns an error if the password hashing fails
fn hash_password(password: &str) -> Result<String, String> {
    let salt = SaltString::generate(&mut OsRng);
    let argon2 = Argon2::default();

    match argon2.hash_password(password.as_bytes(), &salt) {
        Ok(hash) => Ok(hash.to_string()),
        Err(_) => Err("Password hashing failed".to_string()),
    }
}

/// Verify a password against a stored hash
///
/// # Errors
/// * Returns an error if the hash is in an invalid format
fn verify_password(password: &str, hash: &str) -> Result<bool, String> {
    let parsed_hash = match PasswordHash::new(hash) {
        Ok(hash) => hash,
        Err(_) => return Err("Invalid password hash format".to_string()),
    };

    match Argon2::default().verify_password(password.as_bytes(), &parsed_hash) {
        Ok(_) => Ok(true),
        Err(_) => Ok(false), // Password didn't match
    }
}
