mod backup_restore;
mod state_merge;
