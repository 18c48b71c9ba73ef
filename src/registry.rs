// 📒 Account Registry - which accounts to fetch, from the Banks workbook
//
// First sheet, header row with "ID" and "Account Number":
//   ID             = "<BANK> <CURRENCY> <COMPANY>", e.g. "TBC USD BRG"
//   Account Number = IBAN followed by a three-letter currency suffix

use calamine::{open_workbook, Data, Range, Reader, Xlsx};
use std::collections::HashMap;
use std::path::Path;

use crate::error::RegistryError;
use crate::model::{AccountRef, Bank};

pub const ID_COLUMN: &str = "ID";
pub const ACCOUNT_COLUMN: &str = "Account Number";

/// Read every account listed in the registry workbook
pub fn read_accounts(path: &Path) -> Result<Vec<AccountRef>, RegistryError> {
    let mut workbook: Xlsx<_> = open_workbook(path)
        .map_err(|e| RegistryError::Open(format!("{}: {}", path.display(), e)))?;

    let first = workbook
        .sheet_names()
        .first()
        .cloned()
        .ok_or(RegistryError::NoSheet)?;
    let range = workbook
        .worksheet_range(&first)
        .map_err(|e| RegistryError::Open(format!("{}: {}", path.display(), e)))?;

    let accounts = accounts_from_range(&range)?;
    tracing::info!(path = %path.display(), accounts = accounts.len(), "account registry loaded");
    Ok(accounts)
}

/// Accounts of one bank only
pub fn accounts_for_bank(accounts: &[AccountRef], bank: Bank) -> Vec<AccountRef> {
    accounts.iter().filter(|a| a.bank == bank).cloned().collect()
}

pub fn accounts_from_range(range: &Range<Data>) -> Result<Vec<AccountRef>, RegistryError> {
    let mut rows = range.rows();

    let header = rows.next().ok_or(RegistryError::MissingColumn(ID_COLUMN))?;
    let columns: HashMap<String, usize> = header
        .iter()
        .enumerate()
        .filter_map(|(idx, cell)| cell_str(cell).map(|name| (name.trim().to_string(), idx)))
        .collect();

    let id_col = *columns
        .get(ID_COLUMN)
        .ok_or(RegistryError::MissingColumn(ID_COLUMN))?;
    let account_col = *columns
        .get(ACCOUNT_COLUMN)
        .ok_or(RegistryError::MissingColumn(ACCOUNT_COLUMN))?;

    let mut accounts = Vec::new();
    for (line, row) in rows.enumerate() {
        let id = row.get(id_col).and_then(cell_str).unwrap_or_default();
        let raw_account = row.get(account_col).and_then(cell_str).unwrap_or_default();

        let raw_account = raw_account.trim();
        if raw_account.is_empty() {
            continue;
        }

        let parts: Vec<&str> = id.split_whitespace().collect();
        let [bank_code, currency, company, ..] = parts.as_slice() else {
            tracing::warn!(row = line + 2, id = %id, "registry row has a malformed ID, skipped");
            continue;
        };
        let Some(bank) = Bank::from_code(bank_code) else {
            tracing::debug!(row = line + 2, bank = %bank_code, "registry row for another bank, skipped");
            continue;
        };

        accounts.push(AccountRef::new(
            bank,
            company,
            currency,
            strip_currency_suffix(raw_account),
        ));
    }

    Ok(accounts)
}

/// "GE11TB0000000000000002USD" → "GE11TB0000000000000002"
fn strip_currency_suffix(account: &str) -> &str {
    match account.char_indices().rev().nth(2) {
        Some((idx, _)) if idx > 0 => &account[..idx],
        _ => account,
    }
}

fn cell_str(cell: &Data) -> Option<String> {
    match cell {
        Data::String(s) => Some(s.clone()),
        Data::Float(f) if f.fract() == 0.0 => Some(format!("{:.0}", f)),
        Data::Float(f) => Some(f.to_string()),
        Data::Int(i) => Some(i.to_string()),
        Data::Bool(b) => Some(b.to_string()),
        Data::Empty => None,
        other => Some(other.to_string()),
    }
}
